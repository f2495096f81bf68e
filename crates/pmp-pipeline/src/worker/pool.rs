//! Worker pool
//!
//! Each queue gets a fixed number of polling loops. A loop claims one job,
//! keeps its heartbeat alive while the handler runs, then completes or fails
//! it. A separate watchdog loop requeues jobs whose heartbeat went quiet.
//! Cancellation is checked between jobs, so a running job always finishes.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::JobHandler;
use crate::config::{QueueConfig, WorkerConfig};
use crate::error::PipelineResult;
use crate::queue::{
    JobQueue, JobState, ProcessingJob, StallReport, WorkerIdentity, DERIVATIVE_QUEUE,
    DOCUMENT_QUEUE,
};

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub derivative_concurrency: usize,
    pub document_concurrency: usize,
    pub poll_interval: Duration,
    pub heartbeat_interval: Duration,
    pub stall_timeout: Duration,
    pub watchdog_interval: Duration,
}

impl PoolConfig {
    pub fn from_config(queue: &QueueConfig, worker: &WorkerConfig) -> Self {
        Self {
            derivative_concurrency: worker.derivative_concurrency,
            document_concurrency: worker.document_concurrency,
            poll_interval: queue.poll_interval(),
            heartbeat_interval: queue.heartbeat_interval(),
            stall_timeout: queue.stall_timeout(),
            watchdog_interval: queue.watchdog_interval(),
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::from_config(&QueueConfig::default(), &WorkerConfig::default())
    }
}

pub struct WorkerPool {
    queue: Arc<dyn JobQueue>,
    handler: Arc<dyn JobHandler>,
    config: PoolConfig,
    worker: WorkerIdentity,
    tracker: TaskTracker,
}

impl WorkerPool {
    pub fn new(queue: Arc<dyn JobQueue>, handler: Arc<dyn JobHandler>, config: PoolConfig) -> Self {
        Self {
            queue,
            handler,
            config,
            worker: WorkerIdentity::current(),
            tracker: TaskTracker::new(),
        }
    }

    pub fn worker(&self) -> &WorkerIdentity {
        &self.worker
    }

    /// Claim and run at most one job from `queue_name`
    ///
    /// Returns the state the job ended in, or `None` when nothing was
    /// runnable.
    pub async fn run_once(&self, queue_name: &str) -> PipelineResult<Option<JobState>> {
        let Some(job) = self.queue.claim(queue_name, &self.worker).await? else {
            return Ok(None);
        };
        self.execute(job).await.map(Some)
    }

    /// Run jobs from both queues until neither has anything runnable
    pub async fn drain(&self) -> PipelineResult<usize> {
        let mut ran = 0;
        loop {
            let mut progressed = false;
            for queue_name in [DERIVATIVE_QUEUE, DOCUMENT_QUEUE] {
                while self.run_once(queue_name).await?.is_some() {
                    ran += 1;
                    progressed = true;
                }
            }
            if !progressed {
                return Ok(ran);
            }
        }
    }

    async fn execute(&self, job: ProcessingJob) -> PipelineResult<JobState> {
        debug!(
            job_id = %job.job_id,
            kind = job.kind.name(),
            attempt = job.attempts,
            max_attempts = job.max_attempts,
            "Claimed job"
        );

        let heartbeat = self.start_heartbeat_task(job.job_id);
        let result = self.handler.handle(&job).await;
        heartbeat.abort();

        match result {
            Ok(()) => {
                let state = self.queue.complete(job.job_id, &self.worker).await?;
                if state == JobState::Completed {
                    info!(job_id = %job.job_id, kind = job.kind.name(), "Job completed");
                } else {
                    warn!(job_id = %job.job_id, state = state.as_str(), "Claim lost before completion");
                }
                Ok(state)
            },
            Err(err) => {
                self.queue
                    .fail(job.job_id, &self.worker, &err.to_string(), err.is_retryable())
                    .await
            },
        }
    }

    /// One watchdog sweep: requeue or fail silent jobs, then let the handler
    /// settle the ones that failed for good
    pub async fn reclaim_stalled(&self) -> PipelineResult<StallReport> {
        let report = self.queue.reclaim_stalled(self.config.stall_timeout).await?;
        if report.stalled.is_empty() {
            return Ok(report);
        }
        info!(
            requeued = report.requeued.len(),
            failed = report.failed.len(),
            "Watchdog reclaimed stalled jobs"
        );

        for job_id in &report.failed {
            let Some(job) = self.queue.get(*job_id).await? else {
                continue;
            };
            if let Err(e) = self.handler.abandoned(&job).await {
                error!(job_id = %job_id, error = %e, "Failed to settle abandoned job");
            }
        }
        Ok(report)
    }

    fn start_heartbeat_task(&self, job_id: Uuid) -> JoinHandle<()> {
        let queue = self.queue.clone();
        let period = self.config.heartbeat_interval;

        tokio::spawn(async move {
            let mut timer = interval_at(Instant::now() + period, period);
            loop {
                timer.tick().await;
                if let Err(e) = queue.heartbeat(job_id).await {
                    warn!(job_id = %job_id, error = %e, "Heartbeat failed");
                }
            }
        })
    }

    /// Spawn the polling loops and the watchdog
    pub fn start(self: &Arc<Self>, cancel: CancellationToken) {
        for (queue_name, concurrency) in [
            (DERIVATIVE_QUEUE, self.config.derivative_concurrency),
            (DOCUMENT_QUEUE, self.config.document_concurrency),
        ] {
            for slot in 0..concurrency {
                let pool = Arc::clone(self);
                let cancel = cancel.clone();
                self.tracker
                    .spawn(async move { pool.worker_loop(queue_name, slot, cancel).await });
            }
        }

        let pool = Arc::clone(self);
        self.tracker
            .spawn(async move { pool.watchdog_loop(cancel).await });

        info!(
            worker_id = %self.worker.worker_id,
            hostname = %self.worker.hostname,
            derivative_workers = self.config.derivative_concurrency,
            document_workers = self.config.document_concurrency,
            "Worker pool started"
        );
    }

    /// Wait for every spawned loop to exit after cancellation
    pub async fn shutdown(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        info!("Worker pool stopped");
    }

    async fn worker_loop(&self, queue_name: &'static str, slot: usize, cancel: CancellationToken) {
        debug!(queue = queue_name, slot, "Worker loop started");
        while !cancel.is_cancelled() {
            match self.run_once(queue_name).await {
                Ok(Some(_)) => continue,
                Ok(None) => {},
                Err(e) => error!(queue = queue_name, slot, error = %e, "Worker loop error"),
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sleep(self.config.poll_interval) => {},
            }
        }
        debug!(queue = queue_name, slot, "Worker loop stopped");
    }

    async fn watchdog_loop(&self, cancel: CancellationToken) {
        let period = self.config.watchdog_interval;
        let mut timer = interval_at(Instant::now() + period, period);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = timer.tick() => {},
            }
            if let Err(e) = self.reclaim_stalled().await {
                error!(error = %e, "Watchdog sweep failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PipelineError;
    use crate::queue::{EnqueueOptions, JobKind, MemoryJobQueue};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fails the first `failures` calls with the given error, then succeeds
    struct Flaky {
        failures: usize,
        retryable: bool,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl JobHandler for Flaky {
        async fn handle(&self, _job: &ProcessingJob) -> PipelineResult<()> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                if self.retryable {
                    Err(PipelineError::Queue("connection reset".into()))
                } else {
                    Err(PipelineError::validation("Image too small (min 100x100px)"))
                }
            } else {
                Ok(())
            }
        }
    }

    fn manifest_job() -> JobKind {
        JobKind::GenerateManifest {
            protocol_id: Uuid::new_v4(),
        }
    }

    fn pool(handler: Arc<Flaky>) -> (Arc<MemoryJobQueue>, WorkerPool) {
        let queue = Arc::new(MemoryJobQueue::default());
        let pool = WorkerPool::new(queue.clone(), handler, PoolConfig::default());
        (queue, pool)
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let handler = Arc::new(Flaky {
            failures: 1,
            retryable: true,
            calls: AtomicUsize::new(0),
        });
        let (queue, pool) = pool(handler.clone());
        let job_id = queue.enqueue(manifest_job(), EnqueueOptions::default()).await.unwrap();

        assert_eq!(pool.run_once(DOCUMENT_QUEUE).await.unwrap(), Some(JobState::Waiting));
        assert_eq!(pool.run_once(DOCUMENT_QUEUE).await.unwrap(), Some(JobState::Completed));
        assert_eq!(pool.run_once(DOCUMENT_QUEUE).await.unwrap(), None);

        let job = queue.get(job_id).await.unwrap().unwrap();
        assert_eq!(job.attempts, 2);
        assert_eq!(job.progress, 100);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_permanent_failure_runs_once() {
        let handler = Arc::new(Flaky {
            failures: usize::MAX,
            retryable: false,
            calls: AtomicUsize::new(0),
        });
        let (queue, pool) = pool(handler.clone());
        let job_id = queue.enqueue(manifest_job(), EnqueueOptions::default()).await.unwrap();

        assert_eq!(pool.drain().await.unwrap(), 1);
        let job = queue.get(job_id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.error.as_deref(), Some("Validation error: Image too small (min 100x100px)"));
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_started_pool_stops_on_cancel() {
        let handler = Arc::new(Flaky {
            failures: 0,
            retryable: false,
            calls: AtomicUsize::new(0),
        });
        let queue = Arc::new(MemoryJobQueue::default());
        let config = PoolConfig {
            poll_interval: Duration::from_millis(10),
            ..PoolConfig::default()
        };
        let pool = Arc::new(WorkerPool::new(queue.clone(), handler.clone(), config));
        let job_id = queue.enqueue(manifest_job(), EnqueueOptions::default()).await.unwrap();

        let cancel = CancellationToken::new();
        pool.start(cancel.clone());
        for _ in 0..100 {
            if queue.get(job_id).await.unwrap().unwrap().state == JobState::Completed {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        cancel.cancel();
        pool.shutdown().await;

        assert_eq!(queue.get(job_id).await.unwrap().unwrap().state, JobState::Completed);
    }

    /// Succeeds and remembers every job handed back by the watchdog
    #[derive(Default)]
    struct Recorder {
        abandoned: tokio::sync::Mutex<Vec<Uuid>>,
    }

    #[async_trait]
    impl JobHandler for Recorder {
        async fn handle(&self, _job: &ProcessingJob) -> PipelineResult<()> {
            Ok(())
        }

        async fn abandoned(&self, job: &ProcessingJob) -> PipelineResult<()> {
            self.abandoned.lock().await.push(job.job_id);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_watchdog_hands_exhausted_jobs_to_handler() {
        let handler = Arc::new(Recorder::default());
        let queue = Arc::new(MemoryJobQueue::default());
        let pool = WorkerPool::new(queue.clone(), handler.clone(), PoolConfig::default());
        let retried = queue.enqueue(manifest_job(), EnqueueOptions::default()).await.unwrap();
        let last_try = queue
            .enqueue(
                manifest_job(),
                EnqueueOptions {
                    max_attempts: Some(1),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        // A worker elsewhere claims both and dies.
        let dead = WorkerIdentity::current();
        for job_id in [retried, last_try] {
            queue.claim(DOCUMENT_QUEUE, &dead).await.unwrap().unwrap();
            queue.expire_heartbeat(job_id, Duration::from_secs(3600)).await;
        }

        let report = pool.reclaim_stalled().await.unwrap();
        assert_eq!(report.requeued, vec![retried]);
        assert_eq!(report.failed, vec![last_try]);
        assert_eq!(*handler.abandoned.lock().await, vec![last_try]);

        // The requeued job now runs here; the dead worker's late report is ignored.
        assert_eq!(pool.run_once(DOCUMENT_QUEUE).await.unwrap(), Some(JobState::Completed));
        assert_eq!(queue.fail(retried, &dead, "late", true).await.unwrap(), JobState::Completed);
    }
}
