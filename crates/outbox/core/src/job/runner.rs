use std::collections::HashMap;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use super::{
    Job, JobArgs, JobError, JobQueueConfig, JobQueueResult, JobStore, JobWorker, NewJob,
    QueueConfig, RetryPolicy,
};
use crate::transaction::TxContext;

/// Object-safe view of a [`JobWorker`] that decodes its own arguments.
#[async_trait]
trait ErasedWorker: Send + Sync + 'static {
    async fn work(&self, job: &Job) -> Result<(), JobError>;
    fn next_retry(&self, job: &Job) -> Option<DateTime<Utc>>;
    fn timeout(&self, job: &Job) -> Option<Duration>;
    fn attempts_exhausted(&self, job: &Job) -> bool;
}

struct TypedWorker<W: JobWorker> {
    worker: W,
    _args: PhantomData<fn() -> W::Args>,
}

#[async_trait]
impl<W: JobWorker> ErasedWorker for TypedWorker<W> {
    async fn work(&self, job: &Job) -> Result<(), JobError> {
        let args: W::Args =
            serde_json::from_value(job.args.clone()).map_err(JobError::cancel)?;
        self.worker.work(job, args).await
    }

    fn next_retry(&self, job: &Job) -> Option<DateTime<Utc>> {
        self.worker.next_retry(job)
    }

    fn timeout(&self, job: &Job) -> Option<Duration> {
        self.worker.timeout(job)
    }

    fn attempts_exhausted(&self, job: &Job) -> bool {
        self.worker.attempts_exhausted(job)
    }
}

/// Inserts jobs and runs registered workers against a [`JobStore`].
pub struct JobQueueClient<S: JobStore> {
    store: Arc<S>,
    config: JobQueueConfig,
    workers: HashMap<&'static str, Arc<dyn ErasedWorker>>,
}

impl<S: JobStore> JobQueueClient<S> {
    pub fn new(store: Arc<S>, config: JobQueueConfig) -> Self {
        Self {
            store,
            config,
            workers: HashMap::new(),
        }
    }

    /// Registers the worker for `W::Args::KIND`, replacing any previous one.
    pub fn add_worker<W: JobWorker>(&mut self, worker: W) -> &mut Self {
        let kind = <W::Args as JobArgs>::KIND;
        if self
            .workers
            .insert(
                kind,
                Arc::new(TypedWorker {
                    worker,
                    _args: PhantomData,
                }),
            )
            .is_some()
        {
            warn!(kind, "replacing previously registered worker");
        }
        self
    }

    pub fn config(&self) -> &JobQueueConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Inserts a job for `args` using the configured attempt limit.
    pub async fn insert<A: JobArgs>(
        &self,
        ctx: &TxContext<S::Tx>,
        args: &A,
    ) -> JobQueueResult<Job> {
        let job = NewJob::from_args(args, self.config.max_attempts)?;
        self.insert_job(ctx, job).await
    }

    pub async fn insert_job(&self, ctx: &TxContext<S::Tx>, job: NewJob) -> JobQueueResult<Job> {
        if !self.config.queues.iter().any(|q| q.name == job.queue) {
            warn!(kind = %job.kind, queue = %job.queue, "inserting job into a queue this client does not work");
        }
        let job = self.store.insert(ctx, job).await?;
        debug!(job_id = %job.id, kind = %job.kind, queue = %job.queue, "job inserted");
        Ok(job)
    }

    /// Works every configured queue until `cancel` fires, then waits for
    /// in-flight jobs to finish.
    ///
    /// # Errors
    ///
    /// Only configuration errors; store failures are logged and retried on
    /// the next poll.
    pub async fn run(&self, cancel: CancellationToken) -> JobQueueResult<()> {
        self.config.validate()?;

        info!(
            queues = ?self.config.queues.iter().map(|q| q.name.as_str()).collect::<Vec<_>>(),
            workers = ?self.workers.keys().collect::<Vec<_>>(),
            "job queue started"
        );

        let tracker = TaskTracker::new();
        futures::future::join_all(
            self.config
                .queues
                .iter()
                .map(|queue| self.work_queue(queue, &cancel, &tracker)),
        )
        .await;

        tracker.close();
        info!(in_flight = tracker.len(), "job queue stopping, draining in-flight jobs");
        tracker.wait().await;
        info!("job queue stopped");
        Ok(())
    }

    async fn work_queue(
        &self,
        queue: &QueueConfig,
        cancel: &CancellationToken,
        tracker: &TaskTracker,
    ) {
        let permits = Arc::new(Semaphore::new(queue.max_workers));

        loop {
            let first = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                permit = Arc::clone(&permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            let mut held = vec![first];
            while let Ok(permit) = Arc::clone(&permits).try_acquire_owned() {
                held.push(permit);
            }

            let pause = match self.store.fetch_available(&queue.name, held.len()).await {
                Ok(jobs) if jobs.is_empty() => self.config.fetch_poll_interval,
                Ok(jobs) => {
                    debug!(queue = %queue.name, count = jobs.len(), "jobs fetched");
                    let mut held = held.into_iter();
                    for job in jobs {
                        let Some(permit) = held.next() else {
                            warn!(queue = %queue.name, job_id = %job.id, "store returned more jobs than requested");
                            break;
                        };
                        self.spawn_job(tracker, job, permit);
                    }
                    self.config.fetch_cooldown
                }
                Err(e) => {
                    error!(queue = %queue.name, error = %e, "failed to fetch jobs");
                    self.config.fetch_poll_interval
                }
            };

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(pause) => {}
            }
        }
        debug!(queue = %queue.name, "queue fetch loop stopped");
    }

    fn spawn_job(&self, tracker: &TaskTracker, job: Job, permit: OwnedSemaphorePermit) {
        let store = Arc::clone(&self.store);
        let worker = self.workers.get(job.kind.as_str()).cloned();
        let default_timeout = self.config.job_timeout;
        let retry_policy = self.config.retry_policy;

        tracker.spawn(async move {
            execute_job(&*store, worker, job, default_timeout, retry_policy).await;
            drop(permit);
        });
    }
}

async fn execute_job<S: JobStore>(
    store: &S,
    worker: Option<Arc<dyn ErasedWorker>>,
    job: Job,
    default_timeout: Duration,
    retry_policy: RetryPolicy,
) {
    let result = match &worker {
        None => Err(JobError::cancel(format!(
            "no worker registered for job kind {}",
            job.kind
        ))),
        Some(worker) => {
            let timeout = worker.timeout(&job).unwrap_or(default_timeout);
            let work = AssertUnwindSafe(worker.work(&job)).catch_unwind();
            match tokio::time::timeout(timeout, work).await {
                Ok(Ok(result)) => result,
                Ok(Err(_)) => Err(JobError::failed("job worker panicked")),
                Err(_) => Err(JobError::failed(format!(
                    "job timed out after {}ms",
                    timeout.as_millis()
                ))),
            }
        }
    };

    let recorded = match result {
        Ok(()) => {
            debug!(job_id = %job.id, kind = %job.kind, attempt = job.attempt, "job completed");
            store.complete(job.id).await
        }
        Err(JobError::Cancel(e)) => {
            error!(job_id = %job.id, kind = %job.kind, error = %e, "job cancelled, discarding");
            store.discard(job.id, &e.to_string()).await
        }
        Err(JobError::Failed(e))
            if worker
                .as_ref()
                .map_or(job.attempts_exhausted(), |w| w.attempts_exhausted(&job)) =>
        {
            error!(
                job_id = %job.id,
                kind = %job.kind,
                attempt = job.attempt,
                error = %e,
                "job failed on its last attempt, discarding"
            );
            store.discard(job.id, &e.to_string()).await
        }
        Err(JobError::Failed(e)) => {
            let at = worker
                .as_ref()
                .and_then(|w| w.next_retry(&job))
                .unwrap_or_else(|| retry_policy.next_retry_at(job.attempt, Utc::now()));
            warn!(
                job_id = %job.id,
                kind = %job.kind,
                attempt = job.attempt,
                retry_at = %at,
                error = %e,
                "job failed, scheduling retry"
            );
            store.retry(job.id, at, &e.to_string()).await
        }
    };

    if let Err(e) = recorded {
        error!(job_id = %job.id, error = %e, "failed to record job outcome");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobQueueError, JobState, QueueConfig};
    use crate::transaction::{Transaction, TransactionResult};
    use serde::{Deserialize, Serialize};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use uuid::Uuid;

    struct NoTx;

    #[async_trait]
    impl Transaction for NoTx {
        async fn commit(&mut self) -> TransactionResult<()> {
            Ok(())
        }

        async fn rollback(&mut self) -> TransactionResult<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct MockStore {
        jobs: Mutex<Vec<Job>>,
    }

    impl MockStore {
        fn job(&self, id: Uuid) -> Job {
            self.jobs
                .lock()
                .unwrap()
                .iter()
                .find(|j| j.id == id)
                .cloned()
                .unwrap()
        }

        fn update(&self, id: Uuid, f: impl FnOnce(&mut Job)) -> JobQueueResult<()> {
            let mut jobs = self.jobs.lock().unwrap();
            let job = jobs
                .iter_mut()
                .find(|j| j.id == id)
                .ok_or(JobQueueError::NotFound(id))?;
            f(job);
            Ok(())
        }
    }

    #[async_trait]
    impl JobStore for MockStore {
        type Tx = NoTx;

        async fn insert(&self, _ctx: &TxContext<NoTx>, job: NewJob) -> JobQueueResult<Job> {
            let job = job.into_job(Uuid::new_v4(), Utc::now());
            self.jobs.lock().unwrap().push(job.clone());
            Ok(job)
        }

        async fn fetch_available(&self, queue: &str, limit: usize) -> JobQueueResult<Vec<Job>> {
            let now = Utc::now();
            let mut jobs = self.jobs.lock().unwrap();
            Ok(jobs
                .iter_mut()
                .filter(|j| j.queue == queue && j.state.is_fetchable() && j.scheduled_at <= now)
                .take(limit)
                .map(|j| {
                    j.state = JobState::Running;
                    j.attempt += 1;
                    j.clone()
                })
                .collect())
        }

        async fn complete(&self, id: Uuid) -> JobQueueResult<()> {
            self.update(id, |j| j.state = JobState::Completed)
        }

        async fn retry(&self, id: Uuid, at: DateTime<Utc>, error: &str) -> JobQueueResult<()> {
            self.update(id, |j| {
                j.state = JobState::Retryable;
                j.scheduled_at = at;
                j.last_error = Some(error.to_string());
            })
        }

        async fn discard(&self, id: Uuid, error: &str) -> JobQueueResult<()> {
            self.update(id, |j| {
                j.state = JobState::Discarded;
                j.last_error = Some(error.to_string());
            })
        }
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct Ping {
        fail: bool,
    }

    impl JobArgs for Ping {
        const KIND: &'static str = "ping";
    }

    #[derive(Default)]
    struct PingWorker {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl JobWorker for Arc<PingWorker> {
        type Args = Ping;

        async fn work(&self, _job: &Job, args: Ping) -> Result<(), JobError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if args.fail {
                Err(JobError::failed("ping failed"))
            } else {
                Ok(())
            }
        }
    }

    fn config() -> JobQueueConfig {
        JobQueueConfig {
            queues: vec![QueueConfig::new("default", 2)],
            max_attempts: 2,
            retry_policy: RetryPolicy::Fixed(Duration::ZERO),
            job_timeout: Duration::from_secs(1),
            fetch_cooldown: Duration::from_millis(10),
            fetch_poll_interval: Duration::from_millis(10),
        }
    }

    async fn run_for(client: Arc<JobQueueClient<MockStore>>, duration: Duration) {
        let cancel = CancellationToken::new();
        let handle = tokio::spawn({
            let client = Arc::clone(&client);
            let cancel = cancel.clone();
            async move { client.run(cancel).await }
        });
        tokio::time::sleep(duration).await;
        cancel.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_job_completes() {
        let worker = Arc::new(PingWorker::default());
        let mut client = JobQueueClient::new(Arc::new(MockStore::default()), config());
        client.add_worker(Arc::clone(&worker));

        let job = client
            .insert(&TxContext::none(), &Ping { fail: false })
            .await
            .unwrap();
        let client = Arc::new(client);
        run_for(Arc::clone(&client), Duration::from_millis(100)).await;

        assert_eq!(client.store().job(job.id).state, JobState::Completed);
        assert_eq!(worker.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_job_is_discarded_after_max_attempts() {
        let worker = Arc::new(PingWorker::default());
        let mut client = JobQueueClient::new(Arc::new(MockStore::default()), config());
        client.add_worker(Arc::clone(&worker));

        let job = client
            .insert(&TxContext::none(), &Ping { fail: true })
            .await
            .unwrap();
        let client = Arc::new(client);
        run_for(Arc::clone(&client), Duration::from_millis(200)).await;

        let stored = client.store().job(job.id);
        assert_eq!(stored.state, JobState::Discarded);
        assert_eq!(stored.attempt, 2);
        assert_eq!(stored.last_error.as_deref(), Some("ping failed"));
        assert_eq!(worker.calls.load(Ordering::SeqCst), 2);
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct Flaky {
        succeed_on: usize,
    }

    impl JobArgs for Flaky {
        const KIND: &'static str = "flaky";
    }

    #[derive(Default)]
    struct UnboundedWorker {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl JobWorker for Arc<UnboundedWorker> {
        type Args = Flaky;

        async fn work(&self, _job: &Job, args: Flaky) -> Result<(), JobError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call < args.succeed_on {
                Err(JobError::failed("not yet"))
            } else {
                Ok(())
            }
        }

        fn attempts_exhausted(&self, _job: &Job) -> bool {
            false
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbounded_worker_retries_past_max_attempts() {
        let worker = Arc::new(UnboundedWorker::default());
        let mut client = JobQueueClient::new(Arc::new(MockStore::default()), config());
        client.add_worker(Arc::clone(&worker));

        let job = client
            .insert(&TxContext::none(), &Flaky { succeed_on: 4 })
            .await
            .unwrap();
        let client = Arc::new(client);
        run_for(Arc::clone(&client), Duration::from_millis(400)).await;

        let stored = client.store().job(job.id);
        assert_eq!(stored.state, JobState::Completed);
        assert_eq!(stored.attempt, 4);
        assert_eq!(worker.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_kind_is_discarded() {
        let client = JobQueueClient::new(Arc::new(MockStore::default()), config());
        let job = client
            .insert(&TxContext::none(), &Ping { fail: false })
            .await
            .unwrap();
        let client = Arc::new(client);
        run_for(Arc::clone(&client), Duration::from_millis(100)).await;

        let stored = client.store().job(job.id);
        assert_eq!(stored.state, JobState::Discarded);
        assert!(stored.last_error.unwrap().contains("no worker registered"));
    }

    #[tokio::test]
    async fn test_run_rejects_invalid_config() {
        let client = JobQueueClient::new(
            Arc::new(MockStore::default()),
            JobQueueConfig {
                queues: vec![],
                ..config()
            },
        );
        let err = client.run(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, JobQueueError::Configuration(_)));
    }
}
