//! # Job Queue
//!
//! Durable job queue backing the delegated outbox publisher.
//!
//! Jobs are inserted through a [`JobStore`], optionally inside the caller's
//! transaction, and executed by [`JobQueueClient`] which owns the retry
//! schedule, the attempt limit and the per-job timeout.
//!
//! ```text
//! available ──fetch──▶ running ──Ok──────────────▶ completed
//!     ▲                   │
//!     │                   ├─Err, attempts left──▶ retryable ─(scheduled_at)─┐
//!     └───────────────────┼──────────────────────────────────────────────────┘
//!                         └─Err, exhausted / cancel ─▶ discarded
//! ```

mod runner;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::error::{BoxError, Classify, ErrorCategory};
use crate::transaction::{Transaction, TransactionError, TxContext};

pub use runner::JobQueueClient;

/// Queue used when a job does not name one.
pub const DEFAULT_QUEUE: &str = "default";

/// Lifecycle state of a job row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Available,
    Running,
    Retryable,
    Completed,
    Discarded,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Available => "available",
            JobState::Running => "running",
            JobState::Retryable => "retryable",
            JobState::Completed => "completed",
            JobState::Discarded => "discarded",
        }
    }

    /// Whether a job in this state can be fetched once `scheduled_at` has passed.
    pub fn is_fetchable(&self) -> bool {
        matches!(self, JobState::Available | JobState::Retryable)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobState {
    type Err = JobQueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "available" => Ok(JobState::Available),
            "running" => Ok(JobState::Running),
            "retryable" => Ok(JobState::Retryable),
            "completed" => Ok(JobState::Completed),
            "discarded" => Ok(JobState::Discarded),
            other => Err(JobQueueError::Storage {
                operation: "decode_state",
                source: format!("unknown job state: {other}").into(),
            }),
        }
    }
}

/// A job as stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub kind: String,
    pub queue: String,
    pub args: serde_json::Value,
    pub state: JobState,
    /// Attempts started so far, including the current one.
    pub attempt: u32,
    pub max_attempts: u32,
    pub scheduled_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

impl Job {
    #[inline]
    pub fn attempts_exhausted(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

/// Job to be inserted.
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub kind: String,
    pub queue: String,
    pub args: serde_json::Value,
    pub max_attempts: u32,
    pub scheduled_at: DateTime<Utc>,
}

impl NewJob {
    /// Serializes `args` into an immediately available job on `A::QUEUE`.
    ///
    /// # Errors
    ///
    /// [`JobQueueError::Encode`] when `args` cannot be serialized.
    pub fn from_args<A: JobArgs>(args: &A, max_attempts: u32) -> JobQueueResult<Self> {
        let args = serde_json::to_value(args).map_err(|source| JobQueueError::Encode {
            kind: A::KIND.to_string(),
            source,
        })?;
        Ok(Self {
            kind: A::KIND.to_string(),
            queue: A::QUEUE.to_string(),
            args,
            max_attempts,
            scheduled_at: Utc::now(),
        })
    }

    /// Moves this job to `queue`.
    pub fn on_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    /// Delays the first attempt until `at`.
    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = at;
        self
    }

    /// Stored form of this job as first inserted.
    pub fn into_job(self, id: Uuid, now: DateTime<Utc>) -> Job {
        Job {
            id,
            kind: self.kind,
            queue: self.queue,
            args: self.args,
            state: JobState::Available,
            attempt: 0,
            max_attempts: self.max_attempts,
            scheduled_at: self.scheduled_at,
            created_at: now,
            last_error: None,
        }
    }
}

/// Typed job arguments, identified by a unique kind.
pub trait JobArgs: Serialize + DeserializeOwned + Send + Sync + 'static {
    const KIND: &'static str;
    const QUEUE: &'static str = DEFAULT_QUEUE;
}

/// Errors returned by workers.
#[derive(Debug, Error)]
pub enum JobError {
    /// Retried until the attempt limit is reached.
    #[error("{0}")]
    Failed(#[source] BoxError),

    /// Discarded immediately; retrying cannot help.
    #[error("job cancelled: {0}")]
    Cancel(#[source] BoxError),
}

impl JobError {
    pub fn failed(err: impl Into<BoxError>) -> Self {
        JobError::Failed(err.into())
    }

    pub fn cancel(err: impl Into<BoxError>) -> Self {
        JobError::Cancel(err.into())
    }
}

/// Executes jobs of one kind.
#[async_trait]
pub trait JobWorker: Send + Sync + 'static {
    type Args: JobArgs;

    async fn work(&self, job: &Job, args: Self::Args) -> Result<(), JobError>;

    /// Overrides the queue's retry policy for a failed attempt.
    fn next_retry(&self, _job: &Job) -> Option<DateTime<Utc>> {
        None
    }

    /// Overrides the queue's job timeout.
    fn timeout(&self, _job: &Job) -> Option<Duration> {
        None
    }

    /// Whether a failed attempt is the last one. Defaults to the job's
    /// `max_attempts`; a worker returning `false` is retried until it
    /// succeeds or cancels.
    fn attempts_exhausted(&self, job: &Job) -> bool {
        job.attempts_exhausted()
    }
}

/// Errors surfaced by the job queue and its stores.
#[derive(Debug, Error)]
pub enum JobQueueError {
    #[error("Failed to encode arguments for job kind {kind}: {source}")]
    Encode {
        kind: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Job {0} not found")]
    NotFound(Uuid),

    #[error("Job store {operation} failed: {source}")]
    Storage {
        operation: &'static str,
        #[source]
        source: BoxError,
    },

    #[error("Invalid job queue configuration: {0}")]
    Configuration(String),

    #[error(transparent)]
    Transaction(#[from] TransactionError),
}

impl JobQueueError {
    pub fn storage(operation: &'static str, source: impl Into<BoxError>) -> Self {
        JobQueueError::Storage {
            operation,
            source: source.into(),
        }
    }
}

impl Classify for JobQueueError {
    fn category(&self) -> ErrorCategory {
        match self {
            JobQueueError::Encode { .. } | JobQueueError::Configuration(_) => {
                ErrorCategory::Validation
            }
            JobQueueError::NotFound(_) | JobQueueError::Storage { .. } => {
                ErrorCategory::Infrastructure
            }
            JobQueueError::Transaction(e) => e.category(),
        }
    }
}

pub type JobQueueResult<T> = Result<T, JobQueueError>;

/// Persistence port for jobs.
#[async_trait]
pub trait JobStore: Send + Sync + 'static {
    type Tx: Transaction;

    /// Inserts a job. Runs on the context transaction when present so the job
    /// commits or rolls back together with the caller's writes.
    async fn insert(&self, ctx: &TxContext<Self::Tx>, job: NewJob) -> JobQueueResult<Job>;

    /// Claims up to `limit` fetchable jobs of `queue` whose `scheduled_at`
    /// has passed: marks them running and increments `attempt`. Concurrent
    /// callers never claim the same job.
    async fn fetch_available(&self, queue: &str, limit: usize) -> JobQueueResult<Vec<Job>>;

    async fn complete(&self, id: Uuid) -> JobQueueResult<()>;

    /// Schedules another attempt at `at`.
    async fn retry(&self, id: Uuid, at: DateTime<Utc>, error: &str) -> JobQueueResult<()>;

    async fn discard(&self, id: Uuid, error: &str) -> JobQueueResult<()>;
}

/// Delay before the next attempt of a failed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPolicy {
    Fixed(Duration),
    /// `base * 2^(attempt - 1)`, capped at `max`.
    Exponential { base: Duration, max: Duration },
}

impl RetryPolicy {
    pub fn delay(&self, attempt: u32) -> Duration {
        match *self {
            RetryPolicy::Fixed(delay) => delay,
            RetryPolicy::Exponential { base, max } => {
                let exponent = attempt.saturating_sub(1).min(31);
                base.saturating_mul(1u32 << exponent).min(max)
            }
        }
    }

    pub fn next_retry_at(&self, attempt: u32, now: DateTime<Utc>) -> DateTime<Utc> {
        let delay = chrono::Duration::from_std(self.delay(attempt))
            .unwrap_or_else(|_| chrono::Duration::MAX);
        now.checked_add_signed(delay).unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::Fixed(Duration::from_secs(30))
    }
}

/// Worker concurrency of one queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    pub name: String,
    pub max_workers: usize,
}

impl QueueConfig {
    pub fn new(name: impl Into<String>, max_workers: usize) -> Self {
        Self {
            name: name.into(),
            max_workers,
        }
    }
}

/// Configuration for [`JobQueueClient`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobQueueConfig {
    pub queues: Vec<QueueConfig>,
    pub max_attempts: u32,
    pub retry_policy: RetryPolicy,
    pub job_timeout: Duration,
    /// Pause after a fetch that returned jobs.
    pub fetch_cooldown: Duration,
    /// Pause after a fetch that returned nothing or failed.
    pub fetch_poll_interval: Duration,
}

impl Default for JobQueueConfig {
    fn default() -> Self {
        Self {
            queues: vec![QueueConfig::new(DEFAULT_QUEUE, 10)],
            max_attempts: 5,
            retry_policy: RetryPolicy::default(),
            job_timeout: Duration::from_secs(30),
            fetch_cooldown: Duration::from_millis(5000),
            fetch_poll_interval: Duration::from_millis(10000),
        }
    }
}

impl JobQueueConfig {
    /// # Errors
    ///
    /// [`JobQueueError::Configuration`] when no queue is configured, a queue
    /// has zero workers, or `max_attempts` is zero.
    pub fn validate(&self) -> JobQueueResult<()> {
        if self.queues.is_empty() {
            return Err(JobQueueError::Configuration(
                "at least one queue is required".to_string(),
            ));
        }
        if let Some(queue) = self.queues.iter().find(|q| q.max_workers == 0) {
            return Err(JobQueueError::Configuration(format!(
                "queue {} has no workers",
                queue.name
            )));
        }
        if self.max_attempts == 0 {
            return Err(JobQueueError::Configuration(
                "max_attempts must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Serialize, Deserialize)]
    struct SendEmail {
        to: String,
    }

    impl JobArgs for SendEmail {
        const KIND: &'static str = "send_email";
        const QUEUE: &'static str = "mail";
    }

    #[test]
    fn test_new_job_from_args() {
        let job = NewJob::from_args(
            &SendEmail {
                to: "ops@example.com".to_string(),
            },
            3,
        )
        .unwrap();

        assert_eq!(job.kind, "send_email");
        assert_eq!(job.queue, "mail");
        assert_eq!(job.args["to"], "ops@example.com");
        assert_eq!(job.max_attempts, 3);

        let stored = job.into_job(Uuid::nil(), Utc::now());
        assert_eq!(stored.state, JobState::Available);
        assert_eq!(stored.attempt, 0);
    }

    #[test]
    fn test_exponential_retry_is_capped() {
        let policy = RetryPolicy::Exponential {
            base: Duration::from_secs(1),
            max: Duration::from_secs(10),
        };
        assert_eq!(policy.delay(1), Duration::from_secs(1));
        assert_eq!(policy.delay(2), Duration::from_secs(2));
        assert_eq!(policy.delay(4), Duration::from_secs(8));
        assert_eq!(policy.delay(5), Duration::from_secs(10));
        assert_eq!(policy.delay(200), Duration::from_secs(10));
    }

    #[test]
    fn test_fixed_retry_schedules_from_now() {
        let now = Utc::now();
        let at = RetryPolicy::Fixed(Duration::from_secs(30)).next_retry_at(3, now);
        assert_eq!(at - now, chrono::Duration::seconds(30));
    }

    #[test]
    fn test_job_state_round_trip_and_fetchable() {
        for state in [
            JobState::Available,
            JobState::Running,
            JobState::Retryable,
            JobState::Completed,
            JobState::Discarded,
        ] {
            assert_eq!(state.as_str().parse::<JobState>().unwrap(), state);
        }
        assert!(JobState::Retryable.is_fetchable());
        assert!(!JobState::Running.is_fetchable());
        assert!("paused".parse::<JobState>().is_err());
    }

    #[test]
    fn test_config_validation() {
        assert!(JobQueueConfig::default().validate().is_ok());

        let config = JobQueueConfig {
            queues: vec![],
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = JobQueueConfig {
            queues: vec![QueueConfig::new("outbox", 0)],
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Validation);
        assert!(err.to_string().contains("outbox"));
    }
}
