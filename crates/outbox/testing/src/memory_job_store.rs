//! In-memory implementation of JobStore for testing.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use outbox_core::job::{Job, JobQueueError, JobQueueResult, JobState, JobStore, NewJob};
use outbox_core::transaction::TxContext;
use parking_lot::RwLock;
use uuid::Uuid;

use crate::memory_transactor::{MemoryTransaction, apply_or_stage};

/// In-memory job table.
#[derive(Debug, Default, Clone)]
pub struct InMemoryJobStore {
    inner: Arc<InnerStore>,
}

#[derive(Debug, Default)]
struct InnerStore {
    jobs: RwLock<HashMap<Uuid, Job>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: Uuid) -> Option<Job> {
        self.inner.jobs.read().get(&id).cloned()
    }

    /// All committed jobs, oldest first.
    pub fn jobs(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self.inner.jobs.read().values().cloned().collect();
        jobs.sort_by_key(|job| job.created_at);
        jobs
    }

    pub fn count_in_state(&self, state: JobState) -> usize {
        self.inner
            .jobs
            .read()
            .values()
            .filter(|job| job.state == state)
            .count()
    }

    fn transition(
        &self,
        id: Uuid,
        update: impl FnOnce(&mut Job),
    ) -> JobQueueResult<()> {
        let mut jobs = self.inner.jobs.write();
        let job = jobs.get_mut(&id).ok_or(JobQueueError::NotFound(id))?;
        update(job);
        Ok(())
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    type Tx = MemoryTransaction;

    async fn insert(&self, ctx: &TxContext<MemoryTransaction>, job: NewJob) -> JobQueueResult<Job> {
        let job = job.into_job(Uuid::new_v4(), Utc::now());
        let inner = Arc::clone(&self.inner);
        let stored = job.clone();
        apply_or_stage(ctx, move || {
            inner.jobs.write().insert(stored.id, stored);
        })
        .await?;
        Ok(job)
    }

    async fn fetch_available(&self, queue: &str, limit: usize) -> JobQueueResult<Vec<Job>> {
        let now = Utc::now();
        let mut jobs = self.inner.jobs.write();

        let mut ready: Vec<&mut Job> = jobs
            .values_mut()
            .filter(|job| job.queue == queue && job.state.is_fetchable() && job.scheduled_at <= now)
            .collect();
        ready.sort_by_key(|job| (job.scheduled_at, job.created_at));

        Ok(ready
            .into_iter()
            .take(limit)
            .map(|job| {
                job.state = JobState::Running;
                job.attempt += 1;
                job.clone()
            })
            .collect())
    }

    async fn complete(&self, id: Uuid) -> JobQueueResult<()> {
        self.transition(id, |job| job.state = JobState::Completed)
    }

    async fn retry(&self, id: Uuid, at: DateTime<Utc>, error: &str) -> JobQueueResult<()> {
        self.transition(id, |job| {
            job.state = JobState::Retryable;
            job.scheduled_at = at;
            job.last_error = Some(error.to_string());
        })
    }

    async fn discard(&self, id: Uuid, error: &str) -> JobQueueResult<()> {
        self.transition(id, |job| {
            job.state = JobState::Discarded;
            job.last_error = Some(error.to_string());
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_job(queue: &str) -> NewJob {
        NewJob {
            kind: "ping".to_string(),
            queue: queue.to_string(),
            args: serde_json::json!({}),
            max_attempts: 3,
            scheduled_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_fetch_claims_and_counts_attempts() {
        let store = InMemoryJobStore::new();
        let job = store.insert(&TxContext::none(), new_job("default")).await.unwrap();

        let fetched = store.fetch_available("default", 10).await.unwrap();
        assert_eq!(fetched.len(), 1);
        assert_eq!(fetched[0].attempt, 1);
        assert!(store.fetch_available("default", 10).await.unwrap().is_empty());

        store.retry(job.id, Utc::now(), "boom").await.unwrap();
        let refetched = store.fetch_available("default", 10).await.unwrap();
        assert_eq!(refetched[0].attempt, 2);
        assert_eq!(refetched[0].last_error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn test_fetch_respects_queue_and_schedule() {
        let store = InMemoryJobStore::new();
        let ctx = TxContext::none();
        store.insert(&ctx, new_job("other")).await.unwrap();
        store
            .insert(
                &ctx,
                new_job("default").scheduled_at(Utc::now() + chrono::Duration::hours(1)),
            )
            .await
            .unwrap();

        assert!(store.fetch_available("default", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_job_is_not_found() {
        let store = InMemoryJobStore::new();
        assert!(matches!(
            store.complete(Uuid::new_v4()).await,
            Err(JobQueueError::NotFound(_))
        ));
    }
}
