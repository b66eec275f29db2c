//! PostgreSQL [`JobStore`] on the `outbox_jobs` table.
//!
//! Jobs are claimed with `FOR UPDATE SKIP LOCKED`, so any number of relay
//! processes can share one queue. A job left `running` by a crashed process
//! becomes fetchable again once `rescue_after` has passed since its attempt
//! started.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use outbox_core::job::{Job, JobQueueError, JobQueueResult, JobState, JobStore, NewJob};
use outbox_core::transaction::TxContext;
use sqlx::PgPool;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::transactor::PgTransaction;
use crate::with_executor;

const JOB_COLUMNS: &str =
    "id, kind, queue, args, state, attempt, max_attempts, scheduled_at, created_at, last_error";

/// PostgreSQL implementation of JobStore.
#[derive(Clone)]
pub struct PostgresJobStore {
    pool: PgPool,
    rescue_after: Duration,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            rescue_after: Duration::from_secs(3600),
        }
    }

    /// How long a job may stay `running` before another fetch reclaims it.
    pub fn with_rescue_after(mut self, rescue_after: Duration) -> Self {
        self.rescue_after = rescue_after;
        self
    }

    /// Run database migrations.
    pub async fn migrate(&self) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS outbox_jobs (
                id UUID PRIMARY KEY,
                kind TEXT NOT NULL,
                queue TEXT NOT NULL,
                args JSONB NOT NULL,
                state TEXT NOT NULL DEFAULT 'available',
                attempt INTEGER NOT NULL DEFAULT 0,
                max_attempts INTEGER NOT NULL,
                scheduled_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                attempted_at TIMESTAMPTZ,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                finalized_at TIMESTAMPTZ,
                last_error TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_outbox_jobs_fetch ON outbox_jobs(queue, state, scheduled_at)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn finish(
        &self,
        operation: &'static str,
        id: Uuid,
        state: JobState,
        scheduled_at: Option<DateTime<Utc>>,
        error: Option<&str>,
    ) -> JobQueueResult<()> {
        let finalized = matches!(state, JobState::Completed | JobState::Discarded);
        let result = sqlx::query(
            r#"
            UPDATE outbox_jobs
            SET state = $2,
                scheduled_at = COALESCE($3, scheduled_at),
                last_error = COALESCE($4, last_error),
                finalized_at = CASE WHEN $5 THEN NOW() ELSE NULL END
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(state.as_str())
        .bind(scheduled_at)
        .bind(error)
        .bind(finalized)
        .execute(&self.pool)
        .await
        .map_err(|e| JobQueueError::storage(operation, e))?;

        if result.rows_affected() == 0 {
            return Err(JobQueueError::NotFound(id));
        }
        debug!(job_id = %id, state = %state, "job state updated");
        Ok(())
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    type Tx = PgTransaction;

    #[instrument(skip_all, fields(kind = %job.kind, queue = %job.queue))]
    async fn insert(&self, ctx: &TxContext<PgTransaction>, job: NewJob) -> JobQueueResult<Job> {
        let sql = format!(
            r#"
            INSERT INTO outbox_jobs (id, kind, queue, args, state, attempt, max_attempts, scheduled_at)
            VALUES ($1, $2, $3, $4, 'available', 0, $5, $6)
            RETURNING {JOB_COLUMNS}
            "#
        );
        let query = sqlx::query_as::<_, JobRow>(&sql)
            .bind(Uuid::new_v4())
            .bind(&job.kind)
            .bind(&job.queue)
            .bind(&job.args)
            .bind(to_db_int(job.max_attempts))
            .bind(job.scheduled_at);

        let row = with_executor!(ctx, &self.pool, |executor| query.fetch_one(executor).await)
            .map_err(|e| JobQueueError::storage("insert_job", e))?;
        row.try_into()
    }

    #[instrument(skip(self))]
    async fn fetch_available(&self, queue: &str, limit: usize) -> JobQueueResult<Vec<Job>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let sql = format!(
            r#"
            UPDATE outbox_jobs
            SET state = 'running', attempt = attempt + 1, attempted_at = NOW()
            WHERE id IN (
                SELECT id FROM outbox_jobs
                WHERE queue = $1
                  AND (
                    (state IN ('available', 'retryable') AND scheduled_at <= NOW())
                    OR (state = 'running' AND attempted_at < NOW() - make_interval(secs => $3))
                  )
                ORDER BY scheduled_at ASC
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {JOB_COLUMNS}
            "#
        );

        let mut rows = sqlx::query_as::<_, JobRow>(&sql)
            .bind(queue)
            .bind(limit)
            .bind(self.rescue_after.as_secs_f64())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| JobQueueError::storage("fetch_available", e))?;
        rows.sort_by_key(|row| row.scheduled_at);

        rows.into_iter().map(Job::try_from).collect()
    }

    async fn complete(&self, id: Uuid) -> JobQueueResult<()> {
        self.finish("complete_job", id, JobState::Completed, None, None)
            .await
    }

    async fn retry(&self, id: Uuid, at: DateTime<Utc>, error: &str) -> JobQueueResult<()> {
        self.finish("retry_job", id, JobState::Retryable, Some(at), Some(error))
            .await
    }

    async fn discard(&self, id: Uuid, error: &str) -> JobQueueResult<()> {
        self.finish("discard_job", id, JobState::Discarded, None, Some(error))
            .await
    }
}

fn to_db_int(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

#[derive(Debug, sqlx::FromRow)]
struct JobRow {
    id: Uuid,
    kind: String,
    queue: String,
    args: serde_json::Value,
    state: String,
    attempt: i32,
    max_attempts: i32,
    scheduled_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
    last_error: Option<String>,
}

impl TryFrom<JobRow> for Job {
    type Error = JobQueueError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        Ok(Job {
            id: row.id,
            kind: row.kind,
            queue: row.queue,
            args: row.args,
            state: row.state.parse()?,
            attempt: u32::try_from(row.attempt).unwrap_or_default(),
            max_attempts: u32::try_from(row.max_attempts).unwrap_or_default(),
            scheduled_at: row.scheduled_at,
            created_at: row.created_at,
            last_error: row.last_error,
        })
    }
}
