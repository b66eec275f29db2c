//! # Outbox Publisher
//!
//! Drains the outbox into the message bus, at-least-once.
//!
//! Two interchangeable strategies share the same single-message step
//! ([`publish_message`]):
//!
//! - [`PollingOutboxPublisher`]: a self-timed `WAIT → FETCH → PUBLISH_EACH`
//!   loop. A failed message keeps `send_at` empty and is re-selected on the
//!   next interval.
//! - [`JobQueueOutbox`] + [`OutboxJobWorker`]: every outbox row is paired with
//!   a job inserted in the same transaction; the job queue's attempt count,
//!   retry schedule and timeout drive redelivery.

pub mod job;
pub mod metrics;
pub mod polling;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{error, info};

use crate::outbox::{OutboxMessage, OutboxRepository, OutboxResult};
use crate::pubsub::PubSubError;
use crate::transaction::TxContext;

pub use job::{
    DEFAULT_PUBLISH_RETRY, JobQueueOutbox, OUTBOX_JOB_KIND, OutboxJobWorker, OutboxPublishJob,
};
pub use metrics::{MetricsSnapshot, ProcessResult, PublisherMetrics};
pub use polling::{PollingOutboxPublisher, PollingPublisherConfig};

/// Message-bus side of the publisher.
#[async_trait]
pub trait Publisher: Send + Sync + 'static {
    async fn publish(&self, subject: &str, payload: &[u8]) -> Result<(), PubSubError>;
}

/// Result of one publish attempt, already recorded on the message.
#[derive(Debug)]
pub enum PublishOutcome {
    Sent,
    Failed(PubSubError),
}

impl PublishOutcome {
    #[inline]
    pub fn is_sent(&self) -> bool {
        matches!(self, PublishOutcome::Sent)
    }
}

/// Publishes one message and persists the outcome on it.
///
/// On success `send_at` is stamped; on failure `updated_at` and the error
/// text are recorded and `send_at` stays empty. `update_message` runs either
/// way. The outer `Err` is the update failure; the publish failure travels in
/// [`PublishOutcome::Failed`].
pub async fn publish_message<R, P>(
    repository: &R,
    publisher: &P,
    ctx: &TxContext<R::Tx>,
    message: &mut OutboxMessage,
) -> OutboxResult<PublishOutcome>
where
    R: OutboxRepository + ?Sized,
    P: Publisher + ?Sized,
{
    let outcome = match publisher.publish(&message.subject, &message.payload).await {
        Ok(()) => {
            message.mark_sent(Utc::now());
            info!(message_id = %message.id, subject = %message.subject, "message sent");
            PublishOutcome::Sent
        }
        Err(e) => {
            error!(message_id = %message.id, subject = %message.subject, error = %e, "failed to publish message");
            message.mark_failed(Utc::now(), e.to_string());
            PublishOutcome::Failed(e)
        }
    };

    repository.update_message(ctx, message).await?;
    Ok(outcome)
}
