//! Postgres job queue
//!
//! Claims use `FOR UPDATE SKIP LOCKED` so any number of workers can poll the
//! same table without handing one job to two of them.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{types::Json, FromRow, PgPool};
use std::time::Duration;
use tracing::{debug, error, warn};
use uuid::Uuid;

use super::{
    AttemptLimits, BackoffPolicy, EnqueueOptions, JobKind, JobQueue, JobState, ProcessingJob,
    QueueCounts, StallReport, WorkerIdentity,
};
use crate::error::{PipelineError, PipelineResult};

#[derive(Clone)]
pub struct PgJobQueue {
    pool: PgPool,
    backoff: BackoffPolicy,
    limits: AttemptLimits,
}

impl PgJobQueue {
    pub fn new(pool: PgPool, backoff: BackoffPolicy, limits: AttemptLimits) -> Self {
        Self {
            pool,
            backoff,
            limits,
        }
    }

    async fn current_state(&self, job_id: Uuid) -> PipelineResult<JobState> {
        let (state,): (String,) = sqlx::query_as("SELECT state FROM pipeline_jobs WHERE job_id = $1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("job {job_id}")))?;
        state.parse()
    }
}

#[derive(FromRow)]
struct JobRow {
    job_id: Uuid,
    queue: String,
    kind: Json<JobKind>,
    state: String,
    attempts: i32,
    max_attempts: i32,
    progress: i16,
    priority: i32,
    error: Option<String>,
    run_at: DateTime<Utc>,
    heartbeat_at: Option<DateTime<Utc>>,
    worker_id: Option<Uuid>,
    created_at: DateTime<Utc>,
}

impl TryFrom<JobRow> for ProcessingJob {
    type Error = PipelineError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        Ok(ProcessingJob {
            job_id: row.job_id,
            queue: row.queue,
            kind: row.kind.0,
            state: row.state.parse()?,
            attempts: row.attempts.max(0) as u32,
            max_attempts: row.max_attempts.max(0) as u32,
            progress: row.progress.clamp(0, 100) as u8,
            priority: row.priority,
            error: row.error,
            run_at: row.run_at,
            heartbeat_at: row.heartbeat_at,
            worker_id: row.worker_id,
            created_at: row.created_at,
        })
    }
}

const JOB_COLUMNS: &str = "job_id, queue, kind, state, attempts, max_attempts, progress, \
     priority, error, run_at, heartbeat_at, worker_id, created_at";

#[async_trait]
impl JobQueue for PgJobQueue {
    async fn enqueue(&self, kind: JobKind, options: EnqueueOptions) -> PipelineResult<Uuid> {
        let job_id = Uuid::new_v4();
        let queue = kind.queue();
        let max_attempts = options
            .max_attempts
            .unwrap_or_else(|| self.limits.for_queue(queue))
            .max(1);
        let delay_ms = options.delay.map_or(0, |d| d.as_millis() as i64);

        sqlx::query(
            r#"
            INSERT INTO pipeline_jobs (job_id, queue, kind, state, max_attempts, priority, run_at)
            VALUES ($1, $2, $3, 'waiting', $4, $5, NOW() + make_interval(secs => $6::double precision / 1000))
            "#,
        )
        .bind(job_id)
        .bind(queue)
        .bind(Json(&kind))
        .bind(max_attempts as i32)
        .bind(options.priority)
        .bind(delay_ms)
        .execute(&self.pool)
        .await?;

        debug!(job_id = %job_id, queue, kind = kind.name(), "Enqueued job");

        Ok(job_id)
    }

    async fn claim(
        &self,
        queue: &str,
        worker: &WorkerIdentity,
    ) -> PipelineResult<Option<ProcessingJob>> {
        let row: Option<JobRow> = sqlx::query_as(&format!(
            r#"
            UPDATE pipeline_jobs
            SET state = 'active',
                attempts = attempts + 1,
                progress = 0,
                worker_id = $2,
                worker_hostname = $3,
                claimed_at = NOW(),
                heartbeat_at = NOW(),
                updated_at = NOW()
            WHERE job_id = (
                SELECT job_id FROM pipeline_jobs
                WHERE queue = $1
                  AND state = 'waiting'
                  AND run_at <= NOW()
                  AND attempts < max_attempts
                ORDER BY priority DESC, created_at, job_id
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(queue)
        .bind(worker.worker_id)
        .bind(&worker.hostname)
        .fetch_optional(&self.pool)
        .await?;

        row.map(ProcessingJob::try_from).transpose()
    }

    async fn heartbeat(&self, job_id: Uuid) -> PipelineResult<()> {
        sqlx::query(
            "UPDATE pipeline_jobs SET heartbeat_at = NOW() WHERE job_id = $1 AND state = 'active'",
        )
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn report_progress(&self, job_id: Uuid, percent: u8) -> PipelineResult<()> {
        sqlx::query(
            r#"
            UPDATE pipeline_jobs
            SET progress = GREATEST(progress, $2), heartbeat_at = NOW(), updated_at = NOW()
            WHERE job_id = $1 AND state = 'active'
            "#,
        )
        .bind(job_id)
        .bind(i16::from(percent.min(100)))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn complete(&self, job_id: Uuid, worker: &WorkerIdentity) -> PipelineResult<JobState> {
        let completed = sqlx::query(
            r#"
            UPDATE pipeline_jobs
            SET state = 'completed',
                progress = 100,
                error = NULL,
                worker_id = NULL,
                worker_hostname = NULL,
                heartbeat_at = NULL,
                completed_at = NOW(),
                updated_at = NOW()
            WHERE job_id = $1 AND state = 'active' AND worker_id = $2
            "#,
        )
        .bind(job_id)
        .bind(worker.worker_id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if completed == 1 {
            return Ok(JobState::Completed);
        }
        let state = self.current_state(job_id).await?;
        debug!(job_id = %job_id, state = state.as_str(), "Ignoring completion from stale claim");
        Ok(state)
    }

    async fn fail(
        &self,
        job_id: Uuid,
        worker: &WorkerIdentity,
        error: &str,
        retryable: bool,
    ) -> PipelineResult<JobState> {
        let mut tx = self.pool.begin().await?;

        let (state, owner, attempts, max_attempts): (String, Option<Uuid>, i32, i32) =
            sqlx::query_as(
                "SELECT state, worker_id, attempts, max_attempts FROM pipeline_jobs \
                 WHERE job_id = $1 FOR UPDATE",
            )
            .bind(job_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("job {job_id}")))?;

        let current: JobState = state.parse()?;
        if current != JobState::Active || owner != Some(worker.worker_id) {
            debug!(job_id = %job_id, state = current.as_str(), "Ignoring failure from stale claim");
            return Ok(current);
        }

        let retry = retryable && attempts < max_attempts;
        let delay_ms = if retry {
            self.backoff.delay(attempts.max(1) as u32).as_millis() as i64
        } else {
            0
        };
        let state = if retry { JobState::Waiting } else { JobState::Failed };

        sqlx::query(
            r#"
            UPDATE pipeline_jobs
            SET state = $2,
                error = $3,
                run_at = NOW() + make_interval(secs => $4::double precision / 1000),
                worker_id = NULL,
                worker_hostname = NULL,
                claimed_at = NULL,
                heartbeat_at = NULL,
                updated_at = NOW()
            WHERE job_id = $1
            "#,
        )
        .bind(job_id)
        .bind(state.as_str())
        .bind(error)
        .bind(delay_ms)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        if retry {
            warn!(
                job_id = %job_id,
                attempts,
                max_attempts,
                retry_in_ms = delay_ms,
                error,
                "Job failed, scheduled for retry"
            );
        } else {
            error!(job_id = %job_id, attempts, error, "Job failed permanently");
        }

        Ok(state)
    }

    async fn reclaim_stalled(&self, timeout: Duration) -> PipelineResult<StallReport> {
        let mut tx = self.pool.begin().await?;

        let stalled: Vec<(Uuid,)> = sqlx::query_as(
            r#"
            UPDATE pipeline_jobs
            SET state = 'stalled', updated_at = NOW()
            WHERE state = 'active'
              AND heartbeat_at <= NOW() - make_interval(secs => $1::double precision)
            RETURNING job_id
            "#,
        )
        .bind(timeout.as_secs_f64())
        .fetch_all(&mut *tx)
        .await?;

        let moved: Vec<(Uuid, String)> = sqlx::query_as(
            r#"
            UPDATE pipeline_jobs
            SET state = CASE WHEN attempts < max_attempts THEN 'waiting' ELSE 'failed' END,
                error = CASE WHEN attempts < max_attempts
                             THEN 'stalled: worker heartbeat lost'
                             ELSE 'stalled: worker heartbeat lost, no attempts left' END,
                run_at = NOW(),
                worker_id = NULL,
                worker_hostname = NULL,
                claimed_at = NULL,
                heartbeat_at = NULL,
                updated_at = NOW()
            WHERE state = 'stalled'
            RETURNING job_id, state
            "#,
        )
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;

        let mut report = StallReport {
            stalled: stalled.into_iter().map(|(id,)| id).collect(),
            ..StallReport::default()
        };
        for (job_id, state) in moved {
            if state == JobState::Waiting.as_str() {
                report.requeued.push(job_id);
            } else {
                report.failed.push(job_id);
            }
        }

        if !report.stalled.is_empty() {
            warn!(
                stalled = report.stalled.len(),
                requeued = report.requeued.len(),
                failed = report.failed.len(),
                "Reclaimed stalled jobs"
            );
        }

        Ok(report)
    }

    async fn counts(&self, queue: &str) -> PipelineResult<QueueCounts> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT state, COUNT(*) FROM pipeline_jobs WHERE queue = $1 GROUP BY state",
        )
        .bind(queue)
        .fetch_all(&self.pool)
        .await?;

        let mut counts = QueueCounts::default();
        for (state, n) in rows {
            counts.add(state.parse()?, n.max(0) as u64);
        }
        Ok(counts)
    }

    async fn get(&self, job_id: Uuid) -> PipelineResult<Option<ProcessingJob>> {
        let row: Option<JobRow> = sqlx::query_as(&format!(
            "SELECT {JOB_COLUMNS} FROM pipeline_jobs WHERE job_id = $1"
        ))
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(ProcessingJob::try_from).transpose()
    }
}
