//! Persistence for photo records, the processing log and legacy protocols
//!
//! Each concern is a trait so workers, the manifest builder and the migration
//! orchestrator can run against Postgres ([`PgRepository`]) or in memory
//! ([`MemoryRepository`]).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pmp_common::PhotoStatus;
use uuid::Uuid;

use crate::error::PipelineResult;
use crate::models::{
    LegacyMigrationStatus, LegacyProtocol, MigrationState, PhotoRecord, ProcessingLogEntry,
};

mod memory;
mod postgres;

pub use memory::MemoryRepository;
pub use postgres::PgRepository;

#[async_trait]
pub trait PhotoRepository: Send + Sync {
    /// Insert or fully replace a record (last write wins)
    async fn upsert_photo(&self, record: &PhotoRecord) -> PipelineResult<()>;

    async fn get_photo(&self, photo_id: Uuid) -> PipelineResult<Option<PhotoRecord>>;

    /// All photos of a protocol, oldest first
    async fn list_protocol_photos(&self, protocol_id: Uuid) -> PipelineResult<Vec<PhotoRecord>>;

    /// Change status without completing; clears derivative data
    async fn set_photo_status(
        &self,
        photo_id: Uuid,
        status: PhotoStatus,
        error: Option<&str>,
        job_id: Option<Uuid>,
    ) -> PipelineResult<()>;

    /// Point a photo at its job unless a worker already did. Status and
    /// derivatives are untouched.
    async fn attach_job(&self, photo_id: Uuid, job_id: Uuid) -> PipelineResult<()>;

    async fn delete_protocol_photos(&self, protocol_id: Uuid) -> PipelineResult<u64>;
}

#[async_trait]
pub trait ProcessingLog: Send + Sync {
    /// Append an entry. A manifest generation entry whose `version` is
    /// already taken for the protocol fails with
    /// [`PipelineError::Conflict`](crate::error::PipelineError::Conflict).
    async fn record(&self, entry: &ProcessingLogEntry) -> PipelineResult<()>;

    async fn latest(
        &self,
        protocol_id: Uuid,
        job_type: &str,
    ) -> PipelineResult<Option<ProcessingLogEntry>>;

    async fn count(&self, protocol_id: Uuid, job_type: &str) -> PipelineResult<u64>;
}

/// Which legacy protocols a migration run should pick up
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct CandidateFilter {
    pub protocol_ids: Option<Vec<Uuid>>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    /// Also return protocols already flagged as migrated
    pub include_migrated: bool,
}

#[async_trait]
pub trait LegacyRepository: Send + Sync {
    /// Matching protocols with their photos, oldest first
    async fn find_candidates(&self, filter: &CandidateFilter)
        -> PipelineResult<Vec<LegacyProtocol>>;

    /// Copy the protocol row to the new-side table; a second copy is a no-op
    async fn copy_protocol_row(&self, protocol: &LegacyProtocol) -> PipelineResult<()>;

    async fn set_migration_state(
        &self,
        protocol_id: Uuid,
        state: MigrationState,
        error: Option<&str>,
    ) -> PipelineResult<()>;

    /// Set `migrated_to_v2` with a timestamp and the `Migrated` state
    async fn mark_migrated(&self, protocol_id: Uuid) -> PipelineResult<()>;

    async fn migration_status(
        &self,
        protocol_id: Uuid,
    ) -> PipelineResult<Option<LegacyMigrationStatus>>;

    /// Delete new-side rows (protocol copy, photo records, processing log)
    /// and reset the legacy flag. Stored objects are left alone.
    async fn rollback_protocol(&self, protocol_id: Uuid) -> PipelineResult<()>;

    async fn legacy_photo_count(&self, protocol_id: Uuid) -> PipelineResult<u64>;

    async fn migrated_row_exists(&self, protocol_id: Uuid) -> PipelineResult<bool>;
}
