//! Background workers
//!
//! [`WorkerPool`] claims jobs from the queue and hands each one to a
//! [`JobHandler`]. [`JobProcessor`] is the production handler: it routes
//! derivative jobs to [`DerivativeWorker`] and whole-protocol jobs to the
//! manifest builder or the migration orchestrator.

use async_trait::async_trait;

use crate::error::PipelineResult;
use crate::queue::ProcessingJob;

pub mod derivative;
mod pool;
mod processor;

pub use derivative::{generate_derivatives, validate_image, DerivativeSettings};
pub use pool::{PoolConfig, WorkerPool};
pub use processor::{DerivativeWorker, JobProcessor};

pub(crate) use processor::render_and_upload;

/// Runs one claimed job
///
/// Returning `Err` hands the failure back to the queue, which retries it when
/// [`crate::error::PipelineError::is_retryable`] says so and attempts remain.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &ProcessingJob) -> PipelineResult<()>;

    /// Called once the watchdog has failed a job whose worker went silent on
    /// its last attempt. `handle` never saw that outcome, so any state it
    /// would have settled is settled here.
    async fn abandoned(&self, _job: &ProcessingJob) -> PipelineResult<()> {
        Ok(())
    }
}
