//! Outbox repository port.

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use super::model::OutboxMessage;
use crate::error::{BoxError, Classify, ErrorCategory};
use crate::transaction::{Transaction, TransactionError, TxContext};

/// Errors surfaced by outbox storage.
#[derive(Debug, Error)]
pub enum OutboxError {
    /// Unique constraint violation on insert.
    #[error("Outbox message already exists: {0}")]
    AlreadyExists(Uuid),

    #[error("Outbox {operation} failed: {source}")]
    Storage {
        operation: &'static str,
        #[source]
        source: BoxError,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Transaction(#[from] TransactionError),
}

impl OutboxError {
    /// Wraps an adapter error with the name of the failed operation.
    pub fn storage(operation: &'static str, source: impl Into<BoxError>) -> Self {
        OutboxError::Storage {
            operation,
            source: source.into(),
        }
    }

    #[inline]
    pub fn is_already_exists(&self) -> bool {
        matches!(self, OutboxError::AlreadyExists(_))
    }
}

impl Classify for OutboxError {
    fn category(&self) -> ErrorCategory {
        match self {
            OutboxError::AlreadyExists(_) => ErrorCategory::Conflict,
            OutboxError::Serialization(_) => ErrorCategory::Validation,
            OutboxError::Storage { .. } => ErrorCategory::Infrastructure,
            OutboxError::Transaction(e) => e.category(),
        }
    }
}

/// Result type for outbox operations
pub type OutboxResult<T> = Result<T, OutboxError>;

/// Persistence port for [`OutboxMessage`].
///
/// Every operation receives the caller's [`TxContext`]; implementations run
/// on the context transaction when present and on their own connection
/// otherwise.
#[async_trait]
pub trait OutboxRepository: Send + Sync + 'static {
    type Tx: Transaction;

    /// Inserts one message.
    ///
    /// Must be called with a context carrying the transaction of the business
    /// mutation the message describes, so both commit or roll back together.
    /// This is caller discipline; the repository does not check it.
    ///
    /// # Errors
    ///
    /// [`OutboxError::AlreadyExists`] on a duplicate id.
    async fn create_message(
        &self,
        ctx: &TxContext<Self::Tx>,
        message: &OutboxMessage,
    ) -> OutboxResult<()>;

    /// Returns up to `batch_size` messages with an empty `send_at`, oldest
    /// `created_at` first.
    async fn get_ready_messages_for_publish(
        &self,
        ctx: &TxContext<Self::Tx>,
        batch_size: usize,
    ) -> OutboxResult<Vec<OutboxMessage>>;

    /// Persists `updated_at`, `last_error_message` and `send_at` for the
    /// message with the same id. Writing the same state twice has no further effect.
    async fn update_message(
        &self,
        ctx: &TxContext<Self::Tx>,
        message: &OutboxMessage,
    ) -> OutboxResult<()>;
}
