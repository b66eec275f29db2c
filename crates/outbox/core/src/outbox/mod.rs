//! # Outbox
//!
//! Durable record of messages that must reach the message bus.
//!
//! A use case writes its business rows and an [`OutboxMessage`] inside one
//! transaction (see [`crate::transaction`]). A publisher later selects rows
//! whose `send_at` is empty, publishes them and stamps the outcome.
//!
//! ```text
//! created ──publish ok──▶ sent (send_at set, never selected again)
//!    │  ▲
//!    │  └── publish failed (updated_at + last_error_message, still ready)
//!    └────────────────────┘
//! ```

pub mod model;
pub mod repository;

pub use model::{BasePayload, OutboxMessage, trace_id_from_payload};
pub use repository::{OutboxError, OutboxRepository, OutboxResult};
