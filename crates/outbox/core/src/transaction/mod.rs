//! Transaction Manager - one transaction per call chain
//!
//! Provides atomic execution of a unit of work so that business rows and the
//! outbox rows describing them are committed (or rolled back) together.
//!
//! # Problem Solved
//!
//! A use case that writes an order and then inserts an `orders.created`
//! outbox message must never end up with only one of the two rows. When use
//! cases call each other, each of them wants "a transaction", but opening a
//! second one for the inner call would split the write set.
//!
//! # Solution
//!
//! The call chain carries a [`TxContext`] with a single "current transaction"
//! slot. [`TransactionManager::execute_tx`] opens a transaction only when the
//! slot is empty and owns its lifecycle; nested calls see the occupied slot,
//! run the work with the same context and leave commit/rollback to the owner.
//!
//! ```text
//! execute_tx(ctx = none)            BEGIN
//! ├── insert order                  (tx)
//! ├── execute_tx(ctx = tx)          reuse, no BEGIN
//! │   └── create_message            (tx)
//! └── Ok                            COMMIT
//! ```
//!
//! Panics inside the work are recovered, converted into
//! [`TransactionError::Panic`] and the transaction is rolled back. The panic
//! is never re-raised, so callers must always inspect the returned result.

#[cfg(test)]
mod tests;

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error};

use crate::error::{BoxError, Classify, ErrorCategory};

/// Error type for transaction operations
#[derive(Debug, Error)]
pub enum TransactionError {
    #[error("failed to begin transaction: {0}")]
    Begin(String),

    #[error("failed to commit transaction: {0}")]
    Commit(String),

    #[error("{cause}; rollback failed: {reason}")]
    Rollback {
        #[source]
        cause: Box<TransactionError>,
        reason: String,
    },

    #[error("unit of work failed: {0}")]
    Work(#[source] BoxError),

    #[error("panic recovered: {message}")]
    Panic { message: String },

    #[error("Transaction already completed")]
    AlreadyCompleted,

    #[error("Database error: {0}")]
    Database(String),
}

impl TransactionError {
    /// Returns the error produced by the unit of work, if it is of type `E`.
    ///
    /// Looks through rollback failures and nested `execute_tx` layers.
    pub fn work_error<E>(&self) -> Option<&E>
    where
        E: std::error::Error + 'static,
    {
        match self {
            TransactionError::Work(source) => source.downcast_ref::<E>().or_else(|| {
                source
                    .downcast_ref::<TransactionError>()
                    .and_then(|inner| inner.work_error::<E>())
            }),
            TransactionError::Rollback { cause, .. } => cause.work_error::<E>(),
            _ => None,
        }
    }

    /// Whether this error originates from a recovered panic.
    pub fn is_panic(&self) -> bool {
        match self {
            TransactionError::Panic { .. } => true,
            TransactionError::Rollback { cause, .. } => cause.is_panic(),
            TransactionError::Work(source) => source
                .downcast_ref::<TransactionError>()
                .is_some_and(TransactionError::is_panic),
            _ => false,
        }
    }
}

impl Classify for TransactionError {
    fn category(&self) -> ErrorCategory {
        if self.is_panic() {
            ErrorCategory::Panic
        } else {
            ErrorCategory::Infrastructure
        }
    }
}

/// Result type for transaction operations
pub type TransactionResult<T> = Result<T, TransactionError>;

/// Transaction isolation level.
///
/// Unknown names parse into [`IsolationLevel::Other`] and are passed through
/// to the transactor untouched, which rejects them when beginning.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub enum IsolationLevel {
    #[default]
    ReadCommitted,
    RepeatableRead,
    Serializable,
    Other(String),
}

impl IsolationLevel {
    /// SQL keyword form, e.g. `READ COMMITTED`.
    pub fn as_sql(&self) -> &str {
        match self {
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
            IsolationLevel::Other(raw) => raw,
        }
    }
}

impl FromStr for IsolationLevel {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace(['_', '-'], " ");
        Ok(match normalized.as_str() {
            "read committed" => IsolationLevel::ReadCommitted,
            "repeatable read" => IsolationLevel::RepeatableRead,
            "serializable" => IsolationLevel::Serializable,
            _ => IsolationLevel::Other(s.to_string()),
        })
    }
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_sql())
    }
}

/// An open database transaction.
#[async_trait]
pub trait Transaction: Send + 'static {
    async fn commit(&mut self) -> TransactionResult<()>;

    async fn rollback(&mut self) -> TransactionResult<()>;
}

/// Begins transactions on the underlying database.
#[async_trait]
pub trait Transactor: Send + Sync + 'static {
    type Tx: Transaction;

    /// Begin a transaction at the given isolation level.
    ///
    /// # Errors
    ///
    /// Returns [`TransactionError::Begin`] when the database refuses to start
    /// the transaction, including for an unsupported isolation level.
    async fn begin(&self, isolation: &IsolationLevel) -> TransactionResult<Self::Tx>;
}

/// Shared handle to the transaction stored in a [`TxContext`].
pub type SharedTx<Tx> = Arc<Mutex<Tx>>;

/// Request-scoped state carried through a call chain.
///
/// Holds at most one open transaction. Repositories run their queries on it
/// when present and on their own connection pool otherwise.
pub struct TxContext<Tx> {
    tx: Option<SharedTx<Tx>>,
}

impl<Tx> TxContext<Tx> {
    /// Context without a transaction.
    pub fn none() -> Self {
        Self { tx: None }
    }

    fn with_transaction(tx: Tx) -> Self {
        Self {
            tx: Some(Arc::new(Mutex::new(tx))),
        }
    }

    #[inline]
    pub fn has_transaction(&self) -> bool {
        self.tx.is_some()
    }

    /// The current transaction, if any.
    #[inline]
    pub fn transaction(&self) -> Option<&SharedTx<Tx>> {
        self.tx.as_ref()
    }
}

impl<Tx> Clone for TxContext<Tx> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<Tx> Default for TxContext<Tx> {
    fn default() -> Self {
        Self::none()
    }
}

impl<Tx> fmt::Debug for TxContext<Tx> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TxContext")
            .field("has_transaction", &self.has_transaction())
            .finish()
    }
}

/// Transaction Manager.
///
/// Executes units of work within a single transaction per call chain,
/// committing on success and rolling back on error or panic.
pub struct TransactionManager<T> {
    transactor: Arc<T>,
}

impl<T> Clone for TransactionManager<T> {
    fn clone(&self) -> Self {
        Self {
            transactor: Arc::clone(&self.transactor),
        }
    }
}

impl<T: Transactor> TransactionManager<T> {
    /// Create a new transaction manager
    #[inline]
    pub fn new(transactor: T) -> Self {
        Self::from_arc(Arc::new(transactor))
    }

    #[inline]
    pub fn from_arc(transactor: Arc<T>) -> Self {
        Self { transactor }
    }

    #[inline]
    pub fn transactor(&self) -> &T {
        &self.transactor
    }

    /// Execute `work` within a transaction.
    ///
    /// - If `ctx` already carries a transaction, `work` receives the same
    ///   context and this call neither commits nor rolls back.
    /// - Otherwise a transaction is opened at `isolation` and handed to
    ///   `work` through a derived context. `Ok` commits; `Err` rolls back and
    ///   returns the original error wrapped in [`TransactionError::Work`].
    /// - A panic in `work` is recovered and returned as
    ///   [`TransactionError::Panic`] after the rollback.
    /// - Commit and rollback failures are reported, never dropped.
    pub async fn execute_tx<F, Fut, R, E>(
        &self,
        ctx: &TxContext<T::Tx>,
        isolation: IsolationLevel,
        work: F,
    ) -> TransactionResult<R>
    where
        F: FnOnce(TxContext<T::Tx>) -> Fut,
        Fut: Future<Output = Result<R, E>>,
        E: Into<BoxError>,
    {
        if ctx.has_transaction() {
            debug!("transaction already present in context, reusing it");
            return run_work(work, ctx.clone()).await;
        }

        let tx = self.transactor.begin(&isolation).await.map_err(|e| match e {
            e @ TransactionError::Begin(_) => e,
            other => TransactionError::Begin(other.to_string()),
        })?;
        debug!(isolation = %isolation, "began new transaction");

        let tx_ctx = TxContext::with_transaction(tx);
        let outcome = run_work(work, tx_ctx.clone()).await;

        let Some(shared) = tx_ctx.tx else {
            return Err(TransactionError::AlreadyCompleted);
        };
        let mut tx = shared.lock().await;

        match outcome {
            Ok(value) => {
                tx.commit()
                    .await
                    .map_err(|e| TransactionError::Commit(e.to_string()))?;
                debug!("transaction committed");
                Ok(value)
            }
            Err(cause) => match tx.rollback().await {
                Ok(()) => {
                    debug!(error = %cause, "transaction rolled back");
                    Err(cause)
                }
                Err(rollback_err) => {
                    error!(error = %cause, rollback_error = %rollback_err, "rollback failed");
                    Err(TransactionError::Rollback {
                        cause: Box::new(cause),
                        reason: rollback_err.to_string(),
                    })
                }
            },
        }
    }
}

/// Runs the unit of work, converting both its error and any panic into a
/// [`TransactionError`].
async fn run_work<Tx, F, Fut, R, E>(work: F, ctx: TxContext<Tx>) -> TransactionResult<R>
where
    F: FnOnce(TxContext<Tx>) -> Fut,
    Fut: Future<Output = Result<R, E>>,
    E: Into<BoxError>,
{
    let future = match std::panic::catch_unwind(AssertUnwindSafe(|| work(ctx))) {
        Ok(future) => future,
        Err(payload) => return Err(panic_error(payload)),
    };

    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(TransactionError::Work(err.into())),
        Err(payload) => Err(panic_error(payload)),
    }
}

fn panic_error(payload: Box<dyn Any + Send>) -> TransactionError {
    let message = if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    };
    error!(panic = %message, "panic recovered inside unit of work");
    TransactionError::Panic { message }
}
