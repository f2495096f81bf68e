//! Migration Orchestrator
//!
//! Replays legacy protocols through the derivative pipeline in batches.
//! Protocols inside a batch run concurrently; batches run one after another.
//! A failing protocol is recorded in the progress errors and never stops the
//! rest of the run.
//!
//! Per protocol the state moves `not_migrated -> in_progress -> migrated` or
//! `failed`. A failed protocol is retried by migrating it again; every write
//! goes to a deterministic key or replaces a whole row, so a re-run is safe.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use pmp_common::checksum::{digest, sha256_hex};
use pmp_common::PhotoStatus;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::db::{CandidateFilter, LegacyRepository, PhotoRepository, ProcessingLog};
use crate::error::{PipelineError, PipelineResult};
use crate::models::{LegacyPhoto, LegacyProtocol, MigrationState, PhotoRecord, ProcessingLogEntry};
use crate::storage::{keys, ObjectMetadata, ObjectStore};
use crate::worker::{render_and_upload, DerivativeSettings};

mod fetcher;

pub use fetcher::LegacyFetcher;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationOptions {
    pub batch_size: usize,
    /// Count candidates without writing anything
    pub dry_run: bool,
    pub selection: CandidateFilter,
    pub skip_photos: bool,
    pub skip_pdfs: bool,
}

impl Default for MigrationOptions {
    fn default() -> Self {
        Self {
            batch_size: crate::config::DEFAULT_MIGRATION_BATCH_SIZE,
            dry_run: false,
            selection: CandidateFilter::default(),
            skip_photos: false,
            skip_pdfs: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationErrorEntry {
    pub protocol_id: Uuid,
    pub error: String,
    pub timestamp: DateTime<Utc>,
}

/// Counters for one run
///
/// `processed == successful + failed` holds in every snapshot, and `total` is
/// set once when the run starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationProgress {
    pub total: usize,
    pub processed: usize,
    pub successful: usize,
    pub failed: usize,
    pub errors: Vec<MigrationErrorEntry>,
    pub start_time: DateTime<Utc>,
    pub estimated_completion: Option<DateTime<Utc>>,
}

impl MigrationProgress {
    fn new(total: usize) -> Self {
        Self {
            total,
            processed: 0,
            successful: 0,
            failed: 0,
            errors: Vec::new(),
            start_time: Utc::now(),
            estimated_completion: None,
        }
    }

    pub fn remaining(&self) -> usize {
        self.total.saturating_sub(self.processed)
    }

    pub fn percent(&self) -> u8 {
        if self.total == 0 {
            return 100;
        }
        ((self.processed * 100) / self.total).min(100) as u8
    }

    /// (elapsed / processed) * remaining, from now
    fn update_eta(&mut self, elapsed: std::time::Duration) {
        if self.processed == 0 {
            return;
        }
        let per_protocol = elapsed.div_f64(self.processed as f64);
        let remaining = per_protocol.mul_f64(self.remaining() as f64);
        self.estimated_completion =
            chrono::Duration::from_std(remaining).ok().map(|d| Utc::now() + d);
    }
}

/// Legacy and migrated photo counts for one protocol
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationReport {
    pub protocol_id: Uuid,
    pub legacy_photo_count: u64,
    pub migrated_photo_count: u64,
    pub issues: Vec<String>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.issues.is_empty()
    }
}

pub struct MigrationOrchestrator {
    legacy: Arc<dyn LegacyRepository>,
    photos: Arc<dyn PhotoRepository>,
    log: Arc<dyn ProcessingLog>,
    store: Arc<dyn ObjectStore>,
    fetcher: LegacyFetcher,
    settings: DerivativeSettings,
    progress: RwLock<MigrationProgress>,
}

impl MigrationOrchestrator {
    pub fn new(
        legacy: Arc<dyn LegacyRepository>,
        photos: Arc<dyn PhotoRepository>,
        log: Arc<dyn ProcessingLog>,
        store: Arc<dyn ObjectStore>,
        fetcher: LegacyFetcher,
        settings: DerivativeSettings,
    ) -> Self {
        Self {
            legacy,
            photos,
            log,
            store,
            fetcher,
            settings,
            progress: RwLock::new(MigrationProgress::new(0)),
        }
    }

    /// Snapshot of the current or last run
    pub async fn progress(&self) -> MigrationProgress {
        self.progress.read().await.clone()
    }

    /// Migrate every candidate matching `options.selection`
    #[instrument(skip(self, options), fields(batch_size = options.batch_size, dry_run = options.dry_run))]
    pub async fn run(&self, options: &MigrationOptions) -> PipelineResult<MigrationProgress> {
        let candidates = self.legacy.find_candidates(&options.selection).await?;
        *self.progress.write().await = MigrationProgress::new(candidates.len());
        info!(
            total = candidates.len(),
            skip_photos = options.skip_photos,
            skip_pdfs = options.skip_pdfs,
            "Starting legacy migration"
        );

        if options.dry_run {
            info!("Dry run, nothing migrated");
            return Ok(self.progress().await);
        }

        let started = Instant::now();
        let batch_size = options.batch_size.max(1);
        let batches = candidates.len().div_ceil(batch_size);

        for (index, batch) in candidates.chunks(batch_size).enumerate() {
            info!(batch = index + 1, batches, size = batch.len(), "Processing batch");

            join_all(batch.iter().map(|protocol| {
                self.migrate_and_count(protocol, options.skip_photos, options.skip_pdfs, started)
            }))
            .await;

            let progress = self.progress.read().await;
            info!(
                processed = progress.processed,
                total = progress.total,
                percent = progress.percent(),
                "Batch finished"
            );
        }

        let progress = self.progress().await;
        info!(
            total = progress.total,
            successful = progress.successful,
            failed = progress.failed,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Legacy migration finished"
        );
        Ok(progress)
    }

    async fn migrate_and_count(
        &self,
        protocol: &LegacyProtocol,
        skip_photos: bool,
        skip_pdfs: bool,
        started: Instant,
    ) {
        let result = self.migrate_protocol(protocol, skip_photos, skip_pdfs).await;

        let mut progress = self.progress.write().await;
        progress.processed += 1;
        match result {
            Ok(()) => progress.successful += 1,
            Err(e) => {
                progress.failed += 1;
                progress.errors.push(MigrationErrorEntry {
                    protocol_id: protocol.id,
                    error: PipelineError::migration(protocol.id, e).to_string(),
                    timestamp: Utc::now(),
                });
            },
        }
        progress.update_eta(started.elapsed());
    }

    /// Migrate one legacy protocol, whatever its current state
    pub async fn migrate_by_id(
        &self,
        protocol_id: Uuid,
        skip_photos: bool,
        skip_pdfs: bool,
    ) -> PipelineResult<()> {
        let filter = CandidateFilter {
            protocol_ids: Some(vec![protocol_id]),
            include_migrated: true,
            ..CandidateFilter::default()
        };
        let protocol = self
            .legacy
            .find_candidates(&filter)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| PipelineError::NotFound(format!("legacy protocol {protocol_id}")))?;
        self.migrate_protocol(&protocol, skip_photos, skip_pdfs).await
    }

    /// Copy the row, replay photos, move the rendered document, then set
    /// the migrated flag. Any failure leaves the protocol in `failed`.
    #[instrument(skip(self, protocol), fields(protocol_id = %protocol.id, photos = protocol.photos.len()))]
    pub async fn migrate_protocol(
        &self,
        protocol: &LegacyProtocol,
        skip_photos: bool,
        skip_pdfs: bool,
    ) -> PipelineResult<()> {
        self.legacy
            .set_migration_state(protocol.id, MigrationState::InProgress, None)
            .await?;

        match self.migrate_steps(protocol, skip_photos, skip_pdfs).await {
            Ok(()) => {
                self.legacy.mark_migrated(protocol.id).await?;
                info!("Protocol migrated");
                Ok(())
            },
            Err(e) => {
                error!(error = %e, "Protocol migration failed");
                let message = e.to_string();
                if let Err(state_err) = self
                    .legacy
                    .set_migration_state(protocol.id, MigrationState::Failed, Some(&message))
                    .await
                {
                    warn!(error = %state_err, "Failed to record migration failure");
                }
                Err(e)
            },
        }
    }

    async fn migrate_steps(
        &self,
        protocol: &LegacyProtocol,
        skip_photos: bool,
        skip_pdfs: bool,
    ) -> PipelineResult<()> {
        self.legacy.copy_protocol_row(protocol).await?;

        if !skip_photos {
            for photo in &protocol.photos {
                self.migrate_photo(protocol.id, photo).await?;
            }
        }

        if !skip_pdfs {
            if let Some(pdf_url) = protocol.pdf_url.as_deref().filter(|u| !u.is_empty()) {
                self.migrate_pdf(protocol.id, pdf_url).await?;
            }
        }

        Ok(())
    }

    /// The legacy photo id becomes the new photo id, so a re-run overwrites
    /// the same keys and record
    async fn migrate_photo(&self, protocol_id: Uuid, photo: &LegacyPhoto) -> PipelineResult<()> {
        let bytes = self.fetcher.fetch(&photo.url).await?;
        let original = digest(&bytes);
        let extension = image::guess_format(&bytes)
            .ok()
            .and_then(|f| f.extensions_str().first().copied())
            .unwrap_or("bin");

        let original_key = keys::original_key(protocol_id, photo.id, extension);
        let object_metadata: ObjectMetadata = [
            ("photo-id".to_string(), photo.id.to_string()),
            ("protocol-id".to_string(), protocol_id.to_string()),
            ("sha256".to_string(), original.sha256.clone()),
            ("legacy-url".to_string(), photo.url.clone()),
        ]
        .into_iter()
        .collect();
        let original_url = self
            .store
            .put(
                &original_key,
                bytes.clone(),
                keys::content_type_for_key(&original_key),
                &object_metadata,
            )
            .await?;

        let (_, derivatives) =
            render_and_upload(self.store.as_ref(), self.settings, protocol_id, photo.id, bytes)
                .await?;

        let previous = self.photos.get_photo(photo.id).await?;
        let processed_at = previous
            .as_ref()
            .filter(|p| p.status == PhotoStatus::Completed)
            .filter(|p| p.derivatives.as_ref().map(|d| &d.hashes) == Some(&derivatives.hashes))
            .and_then(|p| p.processed_at)
            .unwrap_or_else(Utc::now);

        let mut record = PhotoRecord::uploaded(
            photo.id,
            protocol_id,
            original.sha256,
            original_key,
            original_url,
            original.size,
            serde_json::json!({
                "description": photo.description,
                "category": photo.category,
                "legacyUrl": photo.url,
                "migrated": true,
            }),
        );
        if let Some(previous) = &previous {
            record.created_at = previous.created_at;
        }
        record.complete(derivatives, processed_at);
        self.photos.upsert_photo(&record).await
    }

    async fn migrate_pdf(&self, protocol_id: Uuid, pdf_url: &str) -> PipelineResult<()> {
        let bytes = self.fetcher.fetch(pdf_url).await?;
        let pdf_hash = sha256_hex(&bytes);
        let size = bytes.len();
        let key = keys::migrated_pdf_key(protocol_id, &pdf_hash);

        let url = if self.store.exists(&key).await? {
            self.store.url_for(&key)
        } else {
            let metadata: ObjectMetadata = [
                ("protocol-id".to_string(), protocol_id.to_string()),
                ("sha256".to_string(), pdf_hash.clone()),
                ("legacy-url".to_string(), pdf_url.to_string()),
            ]
            .into_iter()
            .collect();
            self.store.put(&key, bytes, "application/pdf", &metadata).await?
        };

        self.log
            .record(&ProcessingLogEntry::completed(
                protocol_id,
                ProcessingLogEntry::PDF_MIGRATION,
                Some(url),
                serde_json::json!({
                    "originalUrl": pdf_url,
                    "pdfHash": pdf_hash,
                    "fileSize": size,
                    "key": key,
                }),
            ))
            .await
    }

    /// Remove the migrated rows and clear the flag
    ///
    /// Uploaded originals, renditions and documents stay in the store; use
    /// [`MigrationOrchestrator::purge_protocol_blobs`] to remove them.
    #[instrument(skip(self), fields(protocol_id = %protocol_id))]
    pub async fn rollback(&self, protocol_id: Uuid) -> PipelineResult<()> {
        self.legacy.rollback_protocol(protocol_id).await?;
        warn!("Protocol migration rolled back, stored objects kept");
        Ok(())
    }

    /// Delete every stored object under the protocol's prefix
    ///
    /// Refused while the protocol is migrated or migrating, since live
    /// records still point at those objects.
    #[instrument(skip(self), fields(protocol_id = %protocol_id))]
    pub async fn purge_protocol_blobs(&self, protocol_id: Uuid) -> PipelineResult<usize> {
        if let Some(status) = self.legacy.migration_status(protocol_id).await? {
            if status.migrated
                || matches!(status.state, MigrationState::Migrated | MigrationState::InProgress)
            {
                return Err(PipelineError::migration(
                    protocol_id,
                    "protocol is migrated; roll it back before purging its objects",
                ));
            }
        }

        let removed = self.store.delete_prefix(&keys::protocol_prefix(protocol_id)).await?;
        info!(removed, "Purged protocol objects");
        Ok(removed)
    }

    /// Compare legacy and migrated photo counts
    ///
    /// Reports differences only; nothing is changed.
    pub async fn validate(&self, protocol_id: Uuid) -> PipelineResult<ValidationReport> {
        let legacy_photo_count = self.legacy.legacy_photo_count(protocol_id).await?;
        let photos = self.photos.list_protocol_photos(protocol_id).await?;
        let migrated_photo_count = photos.len() as u64;

        let mut issues = Vec::new();
        if !self.legacy.migrated_row_exists(protocol_id).await? {
            issues.push("Migrated protocol record not found".to_string());
        }
        if legacy_photo_count != migrated_photo_count {
            issues.push(format!(
                "Photo count mismatch: legacy={legacy_photo_count}, migrated={migrated_photo_count}"
            ));
        }
        match self.legacy.migration_status(protocol_id).await? {
            Some(status) if !status.migrated => issues.push(format!(
                "Protocol is not flagged as migrated (state {})",
                status.state.as_str()
            )),
            None => issues.push("Legacy protocol not found".to_string()),
            Some(_) => {},
        }
        for photo in photos.iter().filter(|p| p.status != PhotoStatus::Completed) {
            issues.push(format!("Photo {} is {}", photo.photo_id, photo.status));
        }

        Ok(ValidationReport {
            protocol_id,
            legacy_photo_count,
            migrated_photo_count,
            issues,
        })
    }
}
