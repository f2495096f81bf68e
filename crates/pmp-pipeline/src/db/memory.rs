use async_trait::async_trait;
use chrono::Utc;
use pmp_common::PhotoStatus;
use std::collections::{BTreeMap, HashSet};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{CandidateFilter, LegacyRepository, PhotoRepository, ProcessingLog};
use crate::error::{PipelineError, PipelineResult};
use crate::models::{
    LegacyMigrationStatus, LegacyProtocol, MigrationState, PhotoRecord, ProcessingLogEntry,
};

#[derive(Default)]
struct Tables {
    photos: BTreeMap<Uuid, PhotoRecord>,
    log: Vec<ProcessingLogEntry>,
    legacy: BTreeMap<Uuid, (LegacyProtocol, LegacyMigrationStatus)>,
    migrated_rows: HashSet<Uuid>,
}

/// In-memory stand-in for the Postgres tables
#[derive(Default)]
pub struct MemoryRepository {
    tables: RwLock<Tables>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_legacy_protocol(&self, protocol: LegacyProtocol) {
        let status = LegacyMigrationStatus {
            state: MigrationState::NotMigrated,
            migrated: false,
            migrated_at: None,
            error: None,
        };
        self.tables
            .write()
            .await
            .legacy
            .insert(protocol.id, (protocol, status));
    }

    pub async fn log_entries(&self, protocol_id: Uuid) -> Vec<ProcessingLogEntry> {
        self.tables
            .read()
            .await
            .log
            .iter()
            .filter(|e| e.protocol_id == protocol_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl PhotoRepository for MemoryRepository {
    async fn upsert_photo(&self, record: &PhotoRecord) -> PipelineResult<()> {
        // created_at and original_hash survive updates, as in the SQL upsert
        self.tables
            .write()
            .await
            .photos
            .entry(record.photo_id)
            .and_modify(|existing| {
                let (created_at, original_hash) =
                    (existing.created_at, std::mem::take(&mut existing.original_hash));
                *existing = record.clone();
                existing.created_at = created_at;
                existing.original_hash = original_hash;
            })
            .or_insert_with(|| record.clone());
        Ok(())
    }

    async fn get_photo(&self, photo_id: Uuid) -> PipelineResult<Option<PhotoRecord>> {
        Ok(self.tables.read().await.photos.get(&photo_id).cloned())
    }

    async fn list_protocol_photos(&self, protocol_id: Uuid) -> PipelineResult<Vec<PhotoRecord>> {
        let mut photos: Vec<PhotoRecord> = self
            .tables
            .read()
            .await
            .photos
            .values()
            .filter(|p| p.protocol_id == protocol_id)
            .cloned()
            .collect();
        photos.sort_by(|a, b| (a.created_at, a.photo_id).cmp(&(b.created_at, b.photo_id)));
        Ok(photos)
    }

    async fn set_photo_status(
        &self,
        photo_id: Uuid,
        status: PhotoStatus,
        error: Option<&str>,
        job_id: Option<Uuid>,
    ) -> PipelineResult<()> {
        let mut tables = self.tables.write().await;
        let record = tables
            .photos
            .get_mut(&photo_id)
            .ok_or_else(|| PipelineError::NotFound(format!("photo {photo_id}")))?;
        record.status = status;
        record.error = error.map(str::to_string);
        record.derivatives = None;
        if job_id.is_some() {
            record.last_job_id = job_id;
        }
        Ok(())
    }

    async fn attach_job(&self, photo_id: Uuid, job_id: Uuid) -> PipelineResult<()> {
        let mut tables = self.tables.write().await;
        let record = tables
            .photos
            .get_mut(&photo_id)
            .ok_or_else(|| PipelineError::NotFound(format!("photo {photo_id}")))?;
        record.last_job_id.get_or_insert(job_id);
        Ok(())
    }

    async fn delete_protocol_photos(&self, protocol_id: Uuid) -> PipelineResult<u64> {
        let mut tables = self.tables.write().await;
        let before = tables.photos.len();
        tables.photos.retain(|_, p| p.protocol_id != protocol_id);
        Ok((before - tables.photos.len()) as u64)
    }
}

#[async_trait]
impl ProcessingLog for MemoryRepository {
    async fn record(&self, entry: &ProcessingLogEntry) -> PipelineResult<()> {
        let mut tables = self.tables.write().await;
        if let Some(version) = entry.manifest_version() {
            let taken = tables.log.iter().any(|e| {
                e.protocol_id == entry.protocol_id && e.manifest_version() == Some(version)
            });
            if taken {
                return Err(PipelineError::Conflict(format!(
                    "manifest version {version} of protocol {}",
                    entry.protocol_id
                )));
            }
        }
        tables.log.push(entry.clone());
        Ok(())
    }

    async fn latest(
        &self,
        protocol_id: Uuid,
        job_type: &str,
    ) -> PipelineResult<Option<ProcessingLogEntry>> {
        // Later pushes win ties on created_at.
        Ok(self
            .tables
            .read()
            .await
            .log
            .iter()
            .filter(|e| e.protocol_id == protocol_id && e.job_type == job_type)
            .enumerate()
            .max_by_key(|(i, e)| (e.created_at, *i))
            .map(|(_, e)| e.clone()))
    }

    async fn count(&self, protocol_id: Uuid, job_type: &str) -> PipelineResult<u64> {
        Ok(self
            .tables
            .read()
            .await
            .log
            .iter()
            .filter(|e| e.protocol_id == protocol_id && e.job_type == job_type)
            .count() as u64)
    }
}

#[async_trait]
impl LegacyRepository for MemoryRepository {
    async fn find_candidates(
        &self,
        filter: &CandidateFilter,
    ) -> PipelineResult<Vec<LegacyProtocol>> {
        let wanted: Option<HashSet<Uuid>> = filter
            .protocol_ids
            .as_ref()
            .map(|ids| ids.iter().copied().collect());

        let mut found: Vec<LegacyProtocol> = self
            .tables
            .read()
            .await
            .legacy
            .values()
            .filter(|(_, status)| filter.include_migrated || !status.migrated)
            .filter(|(p, _)| wanted.as_ref().map_or(true, |ids| ids.contains(&p.id)))
            .filter(|(p, _)| filter.created_after.map_or(true, |t| p.created_at >= t))
            .filter(|(p, _)| filter.created_before.map_or(true, |t| p.created_at <= t))
            .map(|(p, _)| p.clone())
            .collect();
        found.sort_by(|a, b| (a.created_at, a.id).cmp(&(b.created_at, b.id)));
        Ok(found)
    }

    async fn copy_protocol_row(&self, protocol: &LegacyProtocol) -> PipelineResult<()> {
        self.tables.write().await.migrated_rows.insert(protocol.id);
        Ok(())
    }

    async fn set_migration_state(
        &self,
        protocol_id: Uuid,
        state: MigrationState,
        error: Option<&str>,
    ) -> PipelineResult<()> {
        if let Some((_, status)) = self.tables.write().await.legacy.get_mut(&protocol_id) {
            status.state = state;
            status.error = error.map(str::to_string);
        }
        Ok(())
    }

    async fn mark_migrated(&self, protocol_id: Uuid) -> PipelineResult<()> {
        if let Some((_, status)) = self.tables.write().await.legacy.get_mut(&protocol_id) {
            status.state = MigrationState::Migrated;
            status.migrated = true;
            status.migrated_at = Some(Utc::now());
            status.error = None;
        }
        Ok(())
    }

    async fn migration_status(
        &self,
        protocol_id: Uuid,
    ) -> PipelineResult<Option<LegacyMigrationStatus>> {
        Ok(self
            .tables
            .read()
            .await
            .legacy
            .get(&protocol_id)
            .map(|(_, status)| status.clone()))
    }

    async fn rollback_protocol(&self, protocol_id: Uuid) -> PipelineResult<()> {
        let mut tables = self.tables.write().await;
        tables.photos.retain(|_, p| p.protocol_id != protocol_id);
        tables.log.retain(|e| e.protocol_id != protocol_id);
        tables.migrated_rows.remove(&protocol_id);
        if let Some((_, status)) = tables.legacy.get_mut(&protocol_id) {
            *status = LegacyMigrationStatus {
                state: MigrationState::NotMigrated,
                migrated: false,
                migrated_at: None,
                error: None,
            };
        }
        Ok(())
    }

    async fn legacy_photo_count(&self, protocol_id: Uuid) -> PipelineResult<u64> {
        Ok(self
            .tables
            .read()
            .await
            .legacy
            .get(&protocol_id)
            .map_or(0, |(p, _)| p.photos.len() as u64))
    }

    async fn migrated_row_exists(&self, protocol_id: Uuid) -> PipelineResult<bool> {
        Ok(self.tables.read().await.migrated_rows.contains(&protocol_id))
    }
}
