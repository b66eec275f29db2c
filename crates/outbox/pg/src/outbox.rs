//! # PostgresOutboxRepository
//!
//! PostgreSQL implementation of [`OutboxRepository`] on the `outbox_messages`
//! table.
//!
//! Every query runs on the [`TxContext`] transaction when there is one, so a
//! use case can write business rows and its outbox message atomically, and on
//! the pool otherwise.
//!
//! ## Row claiming
//!
//! With `claim_rows` enabled, the ready query claims its rows: selected rows
//! are locked with `FOR UPDATE SKIP LOCKED` and stamped with `updated_at`,
//! and rows stamped less than `claim_lease` ago are skipped. Concurrent
//! publishers therefore never receive the same row within one lease.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use outbox_core::outbox::{OutboxError, OutboxMessage, OutboxRepository, OutboxResult};
use outbox_core::transaction::TxContext;
use sqlx::PgPool;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::transactor::PgTransaction;
use crate::with_executor;

/// Configuration for [`PostgresOutboxRepository`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboxRepositoryConfig {
    pub claim_rows: bool,
    pub claim_lease: Duration,
}

impl Default for OutboxRepositoryConfig {
    fn default() -> Self {
        Self {
            claim_rows: false,
            claim_lease: Duration::from_secs(60),
        }
    }
}

/// PostgreSQL implementation of OutboxRepository.
#[derive(Clone)]
pub struct PostgresOutboxRepository {
    pool: PgPool,
    config: OutboxRepositoryConfig,
}

impl PostgresOutboxRepository {
    /// Create a new repository with default config.
    pub fn new(pool: PgPool) -> Self {
        Self::with_config(pool, OutboxRepositoryConfig::default())
    }

    /// Create a new repository with custom config.
    pub fn with_config(pool: PgPool, config: OutboxRepositoryConfig) -> Self {
        Self { pool, config }
    }

    pub fn config(&self) -> &OutboxRepositoryConfig {
        &self.config
    }

    /// Run database migrations.
    pub async fn migrate(&self) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS outbox_messages (
                uid UUID PRIMARY KEY,
                subject_name TEXT NOT NULL,
                payload BYTEA NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ,
                last_error_msg TEXT,
                send_at TIMESTAMPTZ
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_outbox_messages_ready ON outbox_messages(created_at) WHERE send_at IS NULL",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

const SELECT_COLUMNS: &str =
    "uid, subject_name, payload, created_at, updated_at, last_error_msg, send_at";

#[async_trait]
impl OutboxRepository for PostgresOutboxRepository {
    type Tx = PgTransaction;

    #[instrument(skip_all, fields(message_id = %message.id, subject = %message.subject))]
    async fn create_message(
        &self,
        ctx: &TxContext<PgTransaction>,
        message: &OutboxMessage,
    ) -> OutboxResult<()> {
        let query = sqlx::query(
            r#"
            INSERT INTO outbox_messages (uid, subject_name, payload, created_at, updated_at, last_error_msg, send_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(message.id)
        .bind(&message.subject)
        .bind(&message.payload)
        .bind(message.created_at)
        .bind(message.updated_at)
        .bind(&message.last_error_message)
        .bind(message.send_at);

        with_executor!(ctx, &self.pool, |executor| query.execute(executor).await)
            .map_err(|e| {
                if is_unique_violation(&e) {
                    OutboxError::AlreadyExists(message.id)
                } else {
                    OutboxError::storage("create_message", e)
                }
            })?;

        debug!("outbox message created");
        Ok(())
    }

    #[instrument(skip(self, ctx))]
    async fn get_ready_messages_for_publish(
        &self,
        ctx: &TxContext<PgTransaction>,
        batch_size: usize,
    ) -> OutboxResult<Vec<OutboxMessage>> {
        let limit = i64::try_from(batch_size).unwrap_or(i64::MAX);

        let rows = if self.config.claim_rows {
            let lease_secs = self.config.claim_lease.as_secs_f64();
            let sql = format!(
                r#"
                UPDATE outbox_messages SET updated_at = NOW()
                WHERE uid IN (
                    SELECT uid FROM outbox_messages
                    WHERE send_at IS NULL
                      AND (updated_at IS NULL OR updated_at < NOW() - make_interval(secs => $2))
                    ORDER BY created_at ASC
                    LIMIT $1
                    FOR UPDATE SKIP LOCKED
                )
                RETURNING {SELECT_COLUMNS}
                "#
            );
            let query = sqlx::query_as::<_, OutboxRow>(&sql)
                .bind(limit)
                .bind(lease_secs);
            let mut rows = with_executor!(ctx, &self.pool, |executor| query
                .fetch_all(executor)
                .await)
            .map_err(|e| OutboxError::storage("get_ready_messages_for_publish", e))?;
            rows.sort_by_key(|row| row.created_at);
            rows
        } else {
            let sql = format!(
                "SELECT {SELECT_COLUMNS} FROM outbox_messages WHERE send_at IS NULL ORDER BY created_at ASC LIMIT $1"
            );
            let query = sqlx::query_as::<_, OutboxRow>(&sql).bind(limit);
            with_executor!(ctx, &self.pool, |executor| query.fetch_all(executor).await)
                .map_err(|e| OutboxError::storage("get_ready_messages_for_publish", e))?
        };

        debug!(count = rows.len(), "fetched ready messages");
        Ok(rows.into_iter().map(Into::into).collect())
    }

    #[instrument(skip_all, fields(message_id = %message.id, trace_id = %message.trace_id().unwrap_or_default()))]
    async fn update_message(
        &self,
        ctx: &TxContext<PgTransaction>,
        message: &OutboxMessage,
    ) -> OutboxResult<()> {
        let query = sqlx::query(
            "UPDATE outbox_messages SET updated_at = $1, last_error_msg = $2, send_at = $3 WHERE uid = $4",
        )
        .bind(message.updated_at)
        .bind(&message.last_error_message)
        .bind(message.send_at)
        .bind(message.id);

        let result = with_executor!(ctx, &self.pool, |executor| query.execute(executor).await)
            .map_err(|e| OutboxError::storage("update_message", e))?;

        if result.rows_affected() == 0 {
            debug!("update matched no outbox row");
        }
        Ok(())
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

#[derive(Debug, sqlx::FromRow)]
struct OutboxRow {
    uid: Uuid,
    subject_name: String,
    payload: Vec<u8>,
    created_at: DateTime<Utc>,
    updated_at: Option<DateTime<Utc>>,
    last_error_msg: Option<String>,
    send_at: Option<DateTime<Utc>>,
}

impl From<OutboxRow> for OutboxMessage {
    fn from(row: OutboxRow) -> Self {
        Self {
            id: row.uid,
            subject: row.subject_name,
            payload: row.payload,
            created_at: row.created_at,
            updated_at: row.updated_at,
            last_error_message: row.last_error_msg,
            send_at: row.send_at,
        }
    }
}
