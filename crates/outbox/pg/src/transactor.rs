//! sqlx-backed [`Transactor`].

use async_trait::async_trait;
use outbox_core::transaction::{
    IsolationLevel, Transaction, TransactionError, TransactionResult, Transactor,
};
use sqlx::{PgConnection, PgPool, Postgres};
use tracing::{debug, instrument};

/// Open PostgreSQL transaction.
pub struct PgTransaction {
    inner: Option<sqlx::Transaction<'static, Postgres>>,
}

impl PgTransaction {
    /// Connection to run queries on.
    ///
    /// # Errors
    ///
    /// [`TransactionError::AlreadyCompleted`] after commit or rollback.
    pub fn connection(&mut self) -> TransactionResult<&mut PgConnection> {
        self.inner
            .as_deref_mut()
            .ok_or(TransactionError::AlreadyCompleted)
    }
}

#[async_trait]
impl Transaction for PgTransaction {
    async fn commit(&mut self) -> TransactionResult<()> {
        let tx = self.inner.take().ok_or(TransactionError::AlreadyCompleted)?;
        tx.commit()
            .await
            .map_err(|e| TransactionError::Database(e.to_string()))
    }

    async fn rollback(&mut self) -> TransactionResult<()> {
        let tx = self.inner.take().ok_or(TransactionError::AlreadyCompleted)?;
        tx.rollback()
            .await
            .map_err(|e| TransactionError::Database(e.to_string()))
    }
}

/// Begins transactions on a [`PgPool`].
#[derive(Clone)]
pub struct PgTransactor {
    pool: PgPool,
}

impl PgTransactor {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Transactor for PgTransactor {
    type Tx = PgTransaction;

    #[instrument(skip_all, fields(isolation = %isolation))]
    async fn begin(&self, isolation: &IsolationLevel) -> TransactionResult<PgTransaction> {
        let level = isolation.as_sql();
        // Interpolated into SQL below.
        if level.is_empty() || !level.chars().all(|c| c.is_ascii_alphabetic() || c == ' ') {
            return Err(TransactionError::Begin(format!(
                "invalid isolation level: {level}"
            )));
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| TransactionError::Begin(e.to_string()))?;

        let statement = format!("SET TRANSACTION ISOLATION LEVEL {level}");
        sqlx::query(&statement)
            .execute(&mut *tx)
            .await
            .map_err(|e| TransactionError::Begin(e.to_string()))?;

        debug!("transaction started");
        Ok(PgTransaction { inner: Some(tx) })
    }
}
