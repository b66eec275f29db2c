//! Delegated publisher: one job per outbox message.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use super::{PublishOutcome, Publisher, publish_message};
use crate::error::Classify;
use crate::job::{Job, JobArgs, JobError, JobQueueClient, JobStore, JobWorker, RetryPolicy};
use crate::outbox::{OutboxError, OutboxMessage, OutboxRepository, OutboxResult};
use crate::transaction::TxContext;

/// Job kind of [`OutboxPublishJob`].
pub const OUTBOX_JOB_KIND: &str = "outbox_messages";

/// Job arguments carrying the message to publish.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxPublishJob {
    pub message: OutboxMessage,
}

impl JobArgs for OutboxPublishJob {
    const KIND: &'static str = OUTBOX_JOB_KIND;
}

/// Backoff between publish attempts of one job.
pub const DEFAULT_PUBLISH_RETRY: RetryPolicy = RetryPolicy::Exponential {
    base: Duration::from_secs(1),
    max: Duration::from_secs(300),
};

/// Worker performing the single-message publish step for one job.
///
/// Retryable failures are rescheduled with capped backoff for as long as it
/// takes; the queue's `max_attempts` does not apply. Non-retryable failures,
/// such as a malformed subject, cancel the job.
pub struct OutboxJobWorker<R, P>
where
    R: OutboxRepository,
    P: Publisher,
{
    repository: Arc<R>,
    publisher: Arc<P>,
    retry_policy: RetryPolicy,
    timeout: Option<Duration>,
}

impl<R, P> OutboxJobWorker<R, P>
where
    R: OutboxRepository,
    P: Publisher,
{
    pub fn new(repository: Arc<R>, publisher: Arc<P>) -> Self {
        Self {
            repository,
            publisher,
            retry_policy: DEFAULT_PUBLISH_RETRY,
            timeout: None,
        }
    }

    /// Backoff between attempts, overriding [`DEFAULT_PUBLISH_RETRY`].
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[async_trait]
impl<R, P> JobWorker for OutboxJobWorker<R, P>
where
    R: OutboxRepository,
    P: Publisher,
{
    type Args = OutboxPublishJob;

    async fn work(&self, job: &Job, args: OutboxPublishJob) -> Result<(), JobError> {
        let mut message = args.message;
        let ctx = TxContext::none();

        let outcome = publish_message(&*self.repository, &*self.publisher, &ctx, &mut message)
            .await
            .map_err(|e| {
                error!(job_id = %job.id, message_id = %message.id, error = %e, "failed to update message");
                classify(e)
            })?;

        match outcome {
            PublishOutcome::Sent => Ok(()),
            PublishOutcome::Failed(e) => Err(classify(e)),
        }
    }

    fn next_retry(&self, job: &Job) -> Option<DateTime<Utc>> {
        Some(self.retry_policy.next_retry_at(job.attempt, Utc::now()))
    }

    fn attempts_exhausted(&self, _job: &Job) -> bool {
        false
    }

    fn timeout(&self, _job: &Job) -> Option<Duration> {
        self.timeout
    }
}

fn classify<E>(e: E) -> JobError
where
    E: Classify + std::error::Error + Send + Sync + 'static,
{
    if e.is_retryable() {
        JobError::failed(e)
    } else {
        JobError::cancel(e)
    }
}

/// Outbox repository that enqueues a publish job for every message it stores.
///
/// `create_message` writes the row and the job on the caller's transaction,
/// so both commit or roll back with the business mutation. Reads and updates
/// go straight to the wrapped repository.
pub struct JobQueueOutbox<R, S>
where
    R: OutboxRepository,
    S: JobStore<Tx = R::Tx>,
{
    repository: Arc<R>,
    jobs: Arc<JobQueueClient<S>>,
}

impl<R, S> JobQueueOutbox<R, S>
where
    R: OutboxRepository,
    S: JobStore<Tx = R::Tx>,
{
    pub fn new(repository: Arc<R>, jobs: Arc<JobQueueClient<S>>) -> Self {
        Self { repository, jobs }
    }
}

#[async_trait]
impl<R, S> OutboxRepository for JobQueueOutbox<R, S>
where
    R: OutboxRepository,
    S: JobStore<Tx = R::Tx>,
{
    type Tx = R::Tx;

    async fn create_message(
        &self,
        ctx: &TxContext<Self::Tx>,
        message: &OutboxMessage,
    ) -> OutboxResult<()> {
        self.repository.create_message(ctx, message).await?;

        let job = self
            .jobs
            .insert(
                ctx,
                &OutboxPublishJob {
                    message: message.clone(),
                },
            )
            .await
            .map_err(|e| OutboxError::storage("insert_job", e))?;

        debug!(message_id = %message.id, job_id = %job.id, "outbox publish job enqueued");
        Ok(())
    }

    async fn get_ready_messages_for_publish(
        &self,
        ctx: &TxContext<Self::Tx>,
        batch_size: usize,
    ) -> OutboxResult<Vec<OutboxMessage>> {
        self.repository
            .get_ready_messages_for_publish(ctx, batch_size)
            .await
    }

    async fn update_message(
        &self,
        ctx: &TxContext<Self::Tx>,
        message: &OutboxMessage,
    ) -> OutboxResult<()> {
        self.repository.update_message(ctx, message).await
    }
}
