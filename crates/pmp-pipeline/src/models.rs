//! Records persisted by the pipeline

use chrono::{DateTime, Utc};
use pmp_common::{PhotoStatus, Renditions};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Everything known about the three renditions of a completed photo
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DerivativeSet {
    pub hashes: Renditions<String>,
    pub sizes: Renditions<u64>,
    pub keys: Renditions<String>,
    pub urls: Renditions<String>,
}

impl DerivativeSet {
    pub fn total_size(&self) -> u64 {
        self.sizes.iter().map(|(_, size)| *size).sum()
    }
}

/// A protocol photo and its processing outcome
///
/// `derivatives` is `Some` exactly when `status` is `Completed`; the
/// transition methods keep that true.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhotoRecord {
    pub photo_id: Uuid,
    pub protocol_id: Uuid,
    pub status: PhotoStatus,
    /// sha256 hex of the original upload, never changed after creation
    pub original_hash: String,
    pub original_key: String,
    pub original_url: String,
    pub original_size: u64,
    pub derivatives: Option<DerivativeSet>,
    pub metadata: serde_json::Value,
    pub last_job_id: Option<Uuid>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl PhotoRecord {
    pub fn uploaded(
        photo_id: Uuid,
        protocol_id: Uuid,
        original_hash: String,
        original_key: String,
        original_url: String,
        original_size: u64,
        metadata: serde_json::Value,
    ) -> Self {
        Self {
            photo_id,
            protocol_id,
            status: PhotoStatus::Uploaded,
            original_hash,
            original_key,
            original_url,
            original_size,
            derivatives: None,
            metadata,
            last_job_id: None,
            error: None,
            created_at: Utc::now(),
            processed_at: None,
        }
    }

    /// Move to a non-completed status, dropping any derivative data
    pub fn set_status(&mut self, status: PhotoStatus, error: Option<String>) {
        debug_assert!(status != PhotoStatus::Completed, "use complete() for completion");
        self.status = status;
        self.error = error;
        self.derivatives = None;
    }

    pub fn complete(&mut self, derivatives: DerivativeSet, processed_at: DateTime<Utc>) {
        self.status = PhotoStatus::Completed;
        self.derivatives = Some(derivatives);
        self.error = None;
        self.processed_at = Some(processed_at);
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Audit entry for whole-protocol work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingLogEntry {
    pub id: Uuid,
    pub protocol_id: Uuid,
    pub job_type: String,
    pub status: String,
    pub result_url: Option<String>,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl ProcessingLogEntry {
    pub const MANIFEST_GENERATION: &'static str = "manifest_generation";
    pub const MANIFEST_VERIFICATION: &'static str = "manifest_verification";
    pub const PDF_MIGRATION: &'static str = "pdf_migration";

    pub fn completed(
        protocol_id: Uuid,
        job_type: &str,
        result_url: Option<String>,
        metadata: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            protocol_id,
            job_type: job_type.to_string(),
            status: "completed".to_string(),
            result_url,
            metadata,
            created_at: Utc::now(),
        }
    }

    /// Version of a manifest generation entry; `None` for other job types
    pub fn manifest_version(&self) -> Option<u64> {
        if self.job_type != Self::MANIFEST_GENERATION {
            return None;
        }
        self.metadata["version"].as_u64()
    }
}

/// Migration state of a legacy protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationState {
    NotMigrated,
    InProgress,
    Migrated,
    Failed,
}

impl MigrationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            MigrationState::NotMigrated => "not_migrated",
            MigrationState::InProgress => "in_progress",
            MigrationState::Migrated => "migrated",
            MigrationState::Failed => "failed",
        }
    }
}

impl std::str::FromStr for MigrationState {
    type Err = crate::error::PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "not_migrated" => Ok(MigrationState::NotMigrated),
            "in_progress" => Ok(MigrationState::InProgress),
            "migrated" => Ok(MigrationState::Migrated),
            "failed" => Ok(MigrationState::Failed),
            other => Err(crate::error::PipelineError::validation(format!(
                "Unknown migration state: {other}"
            ))),
        }
    }
}

/// A pre-pipeline protocol and its photos
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LegacyProtocol {
    pub id: Uuid,
    pub vehicle_id: Option<Uuid>,
    pub customer_id: Option<Uuid>,
    pub rental_id: Option<Uuid>,
    pub protocol_type: String,
    pub data: serde_json::Value,
    pub pdf_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub photos: Vec<LegacyPhoto>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LegacyPhoto {
    pub id: Uuid,
    pub url: String,
    pub description: Option<String>,
    pub category: Option<String>,
}

/// Migration bookkeeping stored on a legacy protocol row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LegacyMigrationStatus {
    pub state: MigrationState,
    pub migrated: bool,
    pub migrated_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}
