//! Durable job queue
//!
//! Jobs move `waiting -> active -> {completed | failed | stalled}`. Claiming a
//! job increments `attempts`; a retryable failure sends it back to `waiting`
//! with a backoff delay until `max_attempts` is used up. Active jobs
//! heartbeat while they run, and the watchdog marks jobs whose heartbeat has
//! gone quiet as `stalled` before requeueing them.
//!
//! Delivery is at-least-once: a stalled job that was in fact still running
//! may execute twice, so job handlers must be idempotent.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use crate::error::{PipelineError, PipelineResult};

mod backoff;
mod memory;
mod postgres;

pub use backoff::BackoffPolicy;
pub use memory::MemoryJobQueue;
pub use postgres::PgJobQueue;

/// Queue for per-photo derivative generation
pub const DERIVATIVE_QUEUE: &str = "photo-derivatives";
/// Queue for whole-protocol work: manifests, verification, migration
pub const DOCUMENT_QUEUE: &str = "protocol-documents";

/// Work a job carries, one variant per handler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobKind {
    DeriveDerivatives {
        original_key: String,
        protocol_id: Uuid,
        photo_id: Uuid,
        #[serde(default)]
        metadata: serde_json::Value,
    },
    GenerateManifest {
        protocol_id: Uuid,
    },
    VerifyManifest {
        protocol_id: Uuid,
    },
    MigrateProtocol {
        protocol_id: Uuid,
        #[serde(default)]
        skip_photos: bool,
        #[serde(default)]
        skip_pdfs: bool,
    },
}

impl JobKind {
    pub fn name(&self) -> &'static str {
        match self {
            JobKind::DeriveDerivatives { .. } => "derive_derivatives",
            JobKind::GenerateManifest { .. } => "generate_manifest",
            JobKind::VerifyManifest { .. } => "verify_manifest",
            JobKind::MigrateProtocol { .. } => "migrate_protocol",
        }
    }

    /// Queue this kind of job is routed to
    pub fn queue(&self) -> &'static str {
        match self {
            JobKind::DeriveDerivatives { .. } => DERIVATIVE_QUEUE,
            _ => DOCUMENT_QUEUE,
        }
    }

    pub fn protocol_id(&self) -> Uuid {
        match self {
            JobKind::DeriveDerivatives { protocol_id, .. }
            | JobKind::GenerateManifest { protocol_id }
            | JobKind::VerifyManifest { protocol_id }
            | JobKind::MigrateProtocol { protocol_id, .. } => *protocol_id,
        }
    }

    pub fn photo_id(&self) -> Option<Uuid> {
        match self {
            JobKind::DeriveDerivatives { photo_id, .. } => Some(*photo_id),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Waiting,
    Active,
    Completed,
    Failed,
    Stalled,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Stalled => "stalled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

impl std::str::FromStr for JobState {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(JobState::Waiting),
            "active" => Ok(JobState::Active),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            "stalled" => Ok(JobState::Stalled),
            other => Err(PipelineError::Queue(format!("Unknown job state: {other}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingJob {
    pub job_id: Uuid,
    pub queue: String,
    pub kind: JobKind,
    pub state: JobState,
    pub attempts: u32,
    pub max_attempts: u32,
    /// 0 to 100, never decreases while the job is active
    pub progress: u8,
    pub priority: i32,
    pub error: Option<String>,
    pub run_at: DateTime<Utc>,
    pub heartbeat_at: Option<DateTime<Utc>>,
    /// Worker holding the current claim; `None` unless active
    pub worker_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl ProcessingJob {
    pub fn photo_id(&self) -> Option<Uuid> {
        self.kind.photo_id()
    }

    pub fn protocol_id(&self) -> Uuid {
        self.kind.protocol_id()
    }

    pub fn attempts_left(&self) -> bool {
        self.attempts < self.max_attempts
    }

    /// Whether `worker` still holds the claim on this job
    pub fn is_held_by(&self, worker: &WorkerIdentity) -> bool {
        self.state == JobState::Active && self.worker_id == Some(worker.worker_id)
    }
}

#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    /// Higher runs first within a queue
    pub priority: i32,
    /// Defaults to the queue's configured maximum
    pub max_attempts: Option<u32>,
    pub delay: Option<Duration>,
}

/// Jobs per state in one queue
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub waiting: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
    pub stalled: u64,
}

impl QueueCounts {
    pub(crate) fn add(&mut self, state: JobState, n: u64) {
        match state {
            JobState::Waiting => self.waiting += n,
            JobState::Active => self.active += n,
            JobState::Completed => self.completed += n,
            JobState::Failed => self.failed += n,
            JobState::Stalled => self.stalled += n,
        }
    }
}

/// Outcome of one watchdog sweep
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StallReport {
    /// Jobs whose heartbeat had expired
    pub stalled: Vec<Uuid>,
    pub requeued: Vec<Uuid>,
    /// Stalled jobs with no attempts left
    pub failed: Vec<Uuid>,
}

/// Identifies the process holding a job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerIdentity {
    pub worker_id: Uuid,
    pub hostname: String,
}

impl WorkerIdentity {
    pub fn current() -> Self {
        Self {
            worker_id: Uuid::new_v4(),
            hostname: hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_else(|_| "unknown".to_string()),
        }
    }
}

/// Per-queue attempt limits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttemptLimits {
    pub derivative: u32,
    pub document: u32,
}

impl Default for AttemptLimits {
    fn default() -> Self {
        Self {
            derivative: 3,
            document: 2,
        }
    }
}

impl AttemptLimits {
    pub fn for_queue(&self, queue: &str) -> u32 {
        if queue == DERIVATIVE_QUEUE {
            self.derivative
        } else {
            self.document
        }
    }
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Add a job to the queue its kind routes to
    async fn enqueue(&self, kind: JobKind, options: EnqueueOptions) -> PipelineResult<Uuid>;

    /// Take the next runnable job, highest priority then oldest first
    async fn claim(
        &self,
        queue: &str,
        worker: &WorkerIdentity,
    ) -> PipelineResult<Option<ProcessingJob>>;

    async fn heartbeat(&self, job_id: Uuid) -> PipelineResult<()>;

    /// Values lower than the current progress are ignored
    async fn report_progress(&self, job_id: Uuid, percent: u8) -> PipelineResult<()>;

    /// Mark the job completed if `worker` still holds its claim
    ///
    /// A report from a worker whose claim was lost to the watchdog changes
    /// nothing. Returns the state the job is in afterwards.
    async fn complete(&self, job_id: Uuid, worker: &WorkerIdentity) -> PipelineResult<JobState>;

    /// Record a failure. Retryable failures with attempts left go back to
    /// `waiting` after a backoff delay; everything else becomes `failed`.
    /// Reports from a worker that no longer holds the claim are ignored.
    /// Returns the state the job is in afterwards.
    async fn fail(
        &self,
        job_id: Uuid,
        worker: &WorkerIdentity,
        error: &str,
        retryable: bool,
    ) -> PipelineResult<JobState>;

    /// Mark active jobs silent for longer than `timeout` as stalled, then
    /// requeue them or fail those without attempts left
    async fn reclaim_stalled(&self, timeout: Duration) -> PipelineResult<StallReport>;

    async fn counts(&self, queue: &str) -> PipelineResult<QueueCounts>;

    async fn get(&self, job_id: Uuid) -> PipelineResult<Option<ProcessingJob>>;
}
