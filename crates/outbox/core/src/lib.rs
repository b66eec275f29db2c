//! # Outbox Core
//!
//! Transactional outbox and resilient pub/sub, without infrastructure.
//!
//! - [`transaction`]: one transaction per call chain, nested reuse, panic safety
//! - [`outbox`]: the message model and its repository port
//! - [`publisher`]: polling and job-queue strategies draining the outbox
//! - [`job`]: the durable job queue runtime behind the delegated strategy
//! - [`pubsub`]: broker port and the client that retries failed subscriptions
//! - [`shutdown`]: owned coordinator for ordered cleanup
//!
//! Adapters live in `outbox-pg` (PostgreSQL) and `outbox-nats` (JetStream);
//! `outbox-testing` provides in-memory implementations of every port.

pub mod config;
pub mod error;
pub mod job;
pub mod outbox;
pub mod publisher;
pub mod pubsub;
pub mod shutdown;
pub mod transaction;

pub use config::{ConfigError, ConfigLoader, ConfigResult, PublisherStrategy};
pub use error::{BoxError, Classify, ErrorCategory};
pub use job::{
    Job, JobArgs, JobError, JobQueueClient, JobQueueConfig, JobQueueError, JobQueueResult,
    JobState, JobStore, JobWorker, NewJob, QueueConfig, RetryPolicy,
};
pub use outbox::{OutboxError, OutboxMessage, OutboxRepository, OutboxResult};
pub use publisher::{
    JobQueueOutbox, OutboxJobWorker, OutboxPublishJob, PollingOutboxPublisher,
    PollingPublisherConfig, PublishOutcome, Publisher, publish_message,
};
pub use pubsub::{
    MessageBroker, MessageContext, MessageHandler, PubSubClient, PubSubError,
    ResilientClientConfig, ResilientPubSubClient, StreamHandlers, SubjectHandler,
};
pub use shutdown::{ShutdownConfig, ShutdownCoordinator, ShutdownReason, ShutdownReport};
pub use transaction::{
    IsolationLevel, Transaction, TransactionError, TransactionManager, TransactionResult,
    Transactor, TxContext,
};
