//! Polling publisher against the in-memory outbox.

use std::sync::Arc;
use std::time::Duration;

use outbox_core::outbox::{OutboxMessage, OutboxRepository};
use outbox_core::publisher::{PollingOutboxPublisher, PollingPublisherConfig};
use outbox_core::transaction::TxContext;
use outbox_testing::{InMemoryOutboxRepository, RecordingPublisher};
use tokio_util::sync::CancellationToken;

fn publisher(
    repo: &InMemoryOutboxRepository,
    recorder: &RecordingPublisher,
    batch_size: usize,
) -> PollingOutboxPublisher<InMemoryOutboxRepository, RecordingPublisher> {
    PollingOutboxPublisher::new(
        Arc::new(repo.clone()),
        Arc::new(recorder.clone()),
        PollingPublisherConfig {
            interval: Duration::from_millis(100),
            batch_size,
        },
    )
}

async fn seed(repo: &InMemoryOutboxRepository, subjects: &[&str]) -> Vec<OutboxMessage> {
    let mut messages = Vec::new();
    for subject in subjects {
        let message = OutboxMessage::new(*subject, format!(r#"{{"s":"{subject}"}}"#));
        repo.create_message(&TxContext::none(), &message)
            .await
            .unwrap();
        messages.push(message);
    }
    messages
}

#[tokio::test]
async fn test_failed_message_is_selected_until_sent() {
    let repo = InMemoryOutboxRepository::new();
    let recorder = RecordingPublisher::new();
    let publisher = publisher(&repo, &recorder, 10);
    let [message] = seed(&repo, &["payments.captured"]).await.try_into().unwrap();

    recorder.fail_subject("payments.captured");
    for _ in 0..3 {
        let result = publisher.process_batch().await.unwrap();
        assert_eq!(result.failed, 1);
        let stored = repo.get(message.id).unwrap();
        assert!(stored.is_ready_for_publish());
        assert!(stored.updated_at.is_some());
        assert!(
            stored
                .last_error_message
                .as_deref()
                .unwrap()
                .contains("no responders")
        );
    }

    recorder.recover("payments.captured");
    let result = publisher.process_batch().await.unwrap();
    assert_eq!(result.published, 1);

    let stored = repo.get(message.id).unwrap();
    assert!(stored.send_at.is_some());
    assert!(stored.last_error_message.is_none());

    assert_eq!(publisher.process_batch().await.unwrap().processed, 0);
    assert_eq!(recorder.attempts(), 4);
    assert_eq!(recorder.published_subjects(), vec!["payments.captured"]);
}

#[tokio::test]
async fn test_update_failure_does_not_abort_batch_and_may_duplicate() {
    let repo = InMemoryOutboxRepository::new();
    let recorder = RecordingPublisher::new();
    let publisher = publisher(&repo, &recorder, 10);
    seed(&repo, &["orders.created", "orders.paid"]).await;

    repo.fail_next_updates(1);
    let result = publisher.process_batch().await.unwrap();
    assert_eq!(result.processed, 2);
    assert_eq!(publisher.metrics().update_errors, 1);
    assert_eq!(repo.pending_count(), 1);

    // First message was published but its send_at was never stored.
    publisher.process_batch().await.unwrap();
    assert_eq!(repo.pending_count(), 0);
    assert_eq!(
        recorder.published_subjects(),
        vec!["orders.created", "orders.paid", "orders.created"]
    );
}

#[tokio::test]
async fn test_batch_is_oldest_first_and_bounded() {
    let repo = InMemoryOutboxRepository::new();
    let recorder = RecordingPublisher::new();
    let publisher = publisher(&repo, &recorder, 2);
    seed(&repo, &["orders.a", "orders.b", "orders.c"]).await;

    publisher.process_batch().await.unwrap();
    assert_eq!(recorder.published_subjects(), vec!["orders.a", "orders.b"]);

    publisher.process_batch().await.unwrap();
    assert_eq!(
        recorder.published_subjects(),
        vec!["orders.a", "orders.b", "orders.c"]
    );
}

#[tokio::test(start_paused = true)]
async fn test_run_drains_outbox_and_survives_fetch_errors() {
    let repo = InMemoryOutboxRepository::new();
    let recorder = RecordingPublisher::new();
    let publisher = Arc::new(publisher(&repo, &recorder, 10));
    seed(&repo, &["orders.created"]).await;
    repo.fail_fetch(true);

    let cancel = CancellationToken::new();
    let handle = tokio::spawn({
        let publisher = Arc::clone(&publisher);
        let cancel = cancel.clone();
        async move { publisher.run(cancel).await }
    });

    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(repo.fetch_calls(), 2);
    assert!(recorder.published().is_empty());

    repo.fail_fetch(false);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(repo.pending_count(), 0);

    cancel.cancel();
    handle.await.unwrap();

    let metrics = publisher.metrics();
    assert_eq!(metrics.fetch_errors, 2);
    assert_eq!(metrics.published, 1);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_during_wait_skips_final_fetch() {
    let repo = InMemoryOutboxRepository::new();
    let recorder = RecordingPublisher::new();
    let publisher = Arc::new(publisher(&repo, &recorder, 10));

    let cancel = CancellationToken::new();
    let handle = tokio::spawn({
        let publisher = Arc::clone(&publisher);
        let cancel = cancel.clone();
        async move { publisher.run(cancel).await }
    });

    tokio::time::sleep(Duration::from_millis(150)).await;
    cancel.cancel();
    handle.await.unwrap();

    assert_eq!(repo.fetch_calls(), 1);
}
