//! # outbox-testing
//!
//! In-memory implementations of every outbox port, with counters and
//! failure injection, plus the scenario tests under `tests/`.
//!
//! Stores share transactions through [`MemoryTransaction`]: writes made with
//! a transactional context are applied on commit and dropped on rollback.

pub mod memory_broker;
pub mod memory_job_store;
pub mod memory_outbox;
pub mod memory_transactor;
pub mod recording_publisher;

pub use memory_broker::{DeliveryOutcome, InMemoryBroker, InMemoryDelivery};
pub use memory_job_store::InMemoryJobStore;
pub use memory_outbox::InMemoryOutboxRepository;
pub use memory_transactor::{MemoryTransaction, MemoryTransactor};
pub use recording_publisher::RecordingPublisher;
