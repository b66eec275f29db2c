//! # Outbox PostgreSQL
//!
//! sqlx adapters for the outbox ports:
//!
//! - [`PgTransactor`]: transactions with an explicit isolation level
//! - [`PostgresOutboxRepository`]: the `outbox_messages` table
//! - [`PostgresJobStore`]: the `outbox_jobs` table behind the job-queue publisher
//!
//! Repositories execute on the [`TxContext`](outbox_core::TxContext)
//! transaction when one is present and on the pool otherwise.

pub mod config;
pub mod job_store;
pub mod outbox;
pub mod transactor;

pub use config::DatabaseConfig;
pub use job_store::PostgresJobStore;
pub use outbox::{OutboxRepositoryConfig, PostgresOutboxRepository};
pub use transactor::{PgTransaction, PgTransactor};

/// Runs `$body` with `$executor` bound to the context transaction's connection,
/// or to the pool when the context carries no transaction.
///
/// A completed transaction returns early with the converted
/// [`TransactionError`](outbox_core::TransactionError).
macro_rules! with_executor {
    ($ctx:expr, $pool:expr, |$executor:ident| $body:expr) => {{
        match $ctx.transaction() {
            Some(shared) => {
                let mut guard = shared.lock().await;
                let $executor = match guard.connection() {
                    Ok(connection) => connection,
                    Err(e) => return Err(e.into()),
                };
                $body
            }
            None => {
                let $executor = $pool;
                $body
            }
        }
    }};
}

pub(crate) use with_executor;

/// Runs the migrations of every table this crate owns.
pub async fn migrate(pool: &sqlx::PgPool) -> Result<(), sqlx::Error> {
    PostgresOutboxRepository::new(pool.clone()).migrate().await?;
    PostgresJobStore::new(pool.clone()).migrate().await?;
    tracing::info!("outbox migrations applied");
    Ok(())
}
