//! Self-timed polling publisher.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::metrics::{MetricsSnapshot, ProcessResult, PublisherMetrics};
use super::{PublishOutcome, Publisher, publish_message};
use crate::outbox::{OutboxRepository, OutboxResult};
use crate::transaction::TxContext;

/// Configuration for [`PollingOutboxPublisher`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollingPublisherConfig {
    /// Fixed wait between fetches.
    pub interval: Duration,
    /// Maximum messages per fetch.
    pub batch_size: usize,
}

impl Default for PollingPublisherConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(1000),
            batch_size: 100,
        }
    }
}

/// Polls the outbox on a fixed interval and publishes every ready message.
///
/// Retries are implicit: a message whose publish failed keeps an empty
/// `send_at` and is selected again on a later cycle. Fetch and update errors
/// are logged and the loop carries on.
pub struct PollingOutboxPublisher<R, P>
where
    R: OutboxRepository,
    P: Publisher,
{
    repository: Arc<R>,
    publisher: Arc<P>,
    config: PollingPublisherConfig,
    metrics: PublisherMetrics,
}

impl<R, P> PollingOutboxPublisher<R, P>
where
    R: OutboxRepository,
    P: Publisher,
{
    pub fn new(repository: Arc<R>, publisher: Arc<P>, config: PollingPublisherConfig) -> Self {
        Self {
            repository,
            publisher,
            config,
            metrics: PublisherMetrics::default(),
        }
    }

    pub fn config(&self) -> &PollingPublisherConfig {
        &self.config
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Runs `WAIT → FETCH → PUBLISH_EACH` until `cancel` fires.
    ///
    /// Cancellation is checked before and after every wait, so a cancel
    /// during the wait never triggers one last fetch. An in-flight batch is
    /// finished before the loop observes cancellation.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(
            interval_ms = self.config.interval.as_millis() as u64,
            batch_size = self.config.batch_size,
            "outbox publisher started"
        );

        loop {
            if cancel.is_cancelled() {
                break;
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.interval) => {}
            }

            if cancel.is_cancelled() {
                break;
            }

            if let Err(e) = self.process_batch().await {
                self.metrics.record_fetch_error();
                error!(error = %e, "failed to get ready messages for publish");
            }
        }

        info!(metrics = %self.metrics.snapshot(), "outbox publisher stopped");
    }

    /// One `FETCH → PUBLISH_EACH` pass outside of any transaction.
    ///
    /// # Errors
    ///
    /// Only the fetch error is returned; per-message update failures are
    /// logged and counted.
    pub async fn process_batch(&self) -> OutboxResult<ProcessResult> {
        let started = Instant::now();
        let ctx = TxContext::none();

        let messages = self
            .repository
            .get_ready_messages_for_publish(&ctx, self.config.batch_size)
            .await?;

        if messages.is_empty() {
            debug!("no ready messages");
            return Ok(ProcessResult::empty());
        }

        let mut result = ProcessResult::empty();
        for mut message in messages {
            match publish_message(&*self.repository, &*self.publisher, &ctx, &mut message).await {
                Ok(PublishOutcome::Sent) => result.published += 1,
                Ok(PublishOutcome::Failed(_)) => result.failed += 1,
                Err(e) => {
                    self.metrics.record_update_error();
                    error!(
                        message_id = %message.id,
                        trace_id = %message.trace_id().unwrap_or_default(),
                        error = %e,
                        "failed to update message"
                    );
                    if message.is_ready_for_publish() {
                        result.failed += 1;
                    } else {
                        result.published += 1;
                    }
                }
            }
            result.processed += 1;
        }

        result.duration = started.elapsed();
        self.metrics.record_batch(&result);
        debug!(
            processed = result.processed,
            published = result.published,
            failed = result.failed,
            "batch processed"
        );
        Ok(result)
    }
}
