use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use super::{
    AttemptLimits, BackoffPolicy, EnqueueOptions, JobKind, JobQueue, JobState, ProcessingJob,
    QueueCounts, StallReport, WorkerIdentity,
};
use crate::error::{PipelineError, PipelineResult};

/// Single-process queue with the same state machine as [`super::PgJobQueue`]
pub struct MemoryJobQueue {
    jobs: Mutex<HashMap<Uuid, ProcessingJob>>,
    backoff: BackoffPolicy,
    limits: AttemptLimits,
}

impl Default for MemoryJobQueue {
    fn default() -> Self {
        Self::new(BackoffPolicy::immediate(), AttemptLimits::default())
    }
}

impl MemoryJobQueue {
    pub fn new(backoff: BackoffPolicy, limits: AttemptLimits) -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            backoff,
            limits,
        }
    }

    /// Every job in creation order
    pub async fn jobs(&self) -> Vec<ProcessingJob> {
        let mut jobs: Vec<_> = self.jobs.lock().await.values().cloned().collect();
        jobs.sort_by_key(|j| (j.created_at, j.job_id));
        jobs
    }

    /// Push a job's heartbeat into the past, as if its worker had died
    pub async fn expire_heartbeat(&self, job_id: Uuid, by: Duration) {
        if let Some(job) = self.jobs.lock().await.get_mut(&job_id) {
            let by = chrono::Duration::from_std(by).unwrap_or_else(|_| chrono::Duration::zero());
            job.heartbeat_at = job.heartbeat_at.map(|t| t - by);
        }
    }
}

fn missing(job_id: Uuid) -> PipelineError {
    PipelineError::NotFound(format!("job {job_id}"))
}

#[async_trait]
impl JobQueue for MemoryJobQueue {
    async fn enqueue(&self, kind: JobKind, options: EnqueueOptions) -> PipelineResult<Uuid> {
        let now = Utc::now();
        let queue = kind.queue();
        let job = ProcessingJob {
            job_id: Uuid::new_v4(),
            queue: queue.to_string(),
            max_attempts: options
                .max_attempts
                .unwrap_or_else(|| self.limits.for_queue(queue))
                .max(1),
            kind,
            state: JobState::Waiting,
            attempts: 0,
            progress: 0,
            priority: options.priority,
            error: None,
            run_at: now
                + options
                    .delay
                    .and_then(|d| chrono::Duration::from_std(d).ok())
                    .unwrap_or_else(chrono::Duration::zero),
            heartbeat_at: None,
            worker_id: None,
            created_at: now,
        };
        let job_id = job.job_id;
        self.jobs.lock().await.insert(job_id, job);
        Ok(job_id)
    }

    async fn claim(
        &self,
        queue: &str,
        worker: &WorkerIdentity,
    ) -> PipelineResult<Option<ProcessingJob>> {
        let now = Utc::now();
        let mut jobs = self.jobs.lock().await;
        let next = jobs
            .values()
            .filter(|j| {
                j.queue == queue
                    && j.state == JobState::Waiting
                    && j.run_at <= now
                    && j.attempts_left()
            })
            .min_by_key(|j| (std::cmp::Reverse(j.priority), j.created_at, j.job_id))
            .map(|j| j.job_id);

        Ok(next.and_then(|job_id| {
            jobs.get_mut(&job_id).map(|job| {
                job.state = JobState::Active;
                job.attempts += 1;
                job.progress = 0;
                job.heartbeat_at = Some(now);
                job.worker_id = Some(worker.worker_id);
                job.clone()
            })
        }))
    }

    async fn heartbeat(&self, job_id: Uuid) -> PipelineResult<()> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs.get_mut(&job_id).ok_or_else(|| missing(job_id))?;
        if job.state == JobState::Active {
            job.heartbeat_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn report_progress(&self, job_id: Uuid, percent: u8) -> PipelineResult<()> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs.get_mut(&job_id).ok_or_else(|| missing(job_id))?;
        if job.state == JobState::Active {
            job.progress = job.progress.max(percent.min(100));
            job.heartbeat_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn complete(&self, job_id: Uuid, worker: &WorkerIdentity) -> PipelineResult<JobState> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs.get_mut(&job_id).ok_or_else(|| missing(job_id))?;
        if !job.is_held_by(worker) {
            debug!(job_id = %job_id, state = job.state.as_str(), "Ignoring completion from stale claim");
            return Ok(job.state);
        }
        job.state = JobState::Completed;
        job.progress = 100;
        job.error = None;
        job.worker_id = None;
        Ok(job.state)
    }

    async fn fail(
        &self,
        job_id: Uuid,
        worker: &WorkerIdentity,
        error: &str,
        retryable: bool,
    ) -> PipelineResult<JobState> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs.get_mut(&job_id).ok_or_else(|| missing(job_id))?;
        if !job.is_held_by(worker) {
            debug!(job_id = %job_id, state = job.state.as_str(), "Ignoring failure from stale claim");
            return Ok(job.state);
        }

        let retry = retryable && job.attempts_left();
        job.error = Some(error.to_string());
        job.heartbeat_at = None;
        job.worker_id = None;
        if retry {
            let delay = chrono::Duration::from_std(self.backoff.delay(job.attempts.max(1)))
                .unwrap_or_else(|_| chrono::Duration::zero());
            job.state = JobState::Waiting;
            job.run_at = Utc::now() + delay;
        } else {
            job.state = JobState::Failed;
        }
        Ok(job.state)
    }

    async fn reclaim_stalled(&self, timeout: Duration) -> PipelineResult<StallReport> {
        let timeout = chrono::Duration::from_std(timeout).unwrap_or_else(|_| chrono::Duration::zero());
        let cutoff = Utc::now() - timeout;
        let mut jobs = self.jobs.lock().await;
        let mut report = StallReport::default();

        for job in jobs.values_mut() {
            if job.state == JobState::Active && job.heartbeat_at.map_or(true, |t| t <= cutoff) {
                job.state = JobState::Stalled;
                report.stalled.push(job.job_id);
            }
        }

        for job in jobs.values_mut().filter(|j| j.state == JobState::Stalled) {
            job.heartbeat_at = None;
            job.worker_id = None;
            if job.attempts_left() {
                job.state = JobState::Waiting;
                job.run_at = Utc::now();
                job.error = Some("stalled: worker heartbeat lost".to_string());
                report.requeued.push(job.job_id);
            } else {
                job.state = JobState::Failed;
                job.error = Some("stalled: worker heartbeat lost, no attempts left".to_string());
                report.failed.push(job.job_id);
            }
        }

        Ok(report)
    }

    async fn counts(&self, queue: &str) -> PipelineResult<QueueCounts> {
        let mut counts = QueueCounts::default();
        for job in self.jobs.lock().await.values().filter(|j| j.queue == queue) {
            counts.add(job.state, 1);
        }
        Ok(counts)
    }

    async fn get(&self, job_id: Uuid) -> PipelineResult<Option<ProcessingJob>> {
        Ok(self.jobs.lock().await.get(&job_id).cloned())
    }
}
