use async_trait::async_trait;
use chrono::Utc;
use pmp_common::checksum::Digest;
use pmp_common::{DerivativeKind, PhotoStatus, Renditions};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::derivative::{generate_derivatives, DerivativeSettings, GeneratedDerivatives};
use super::JobHandler;
use crate::db::PhotoRepository;
use crate::error::{PipelineError, PipelineResult};
use crate::manifest::ManifestBuilder;
use crate::migration::MigrationOrchestrator;
use crate::models::{DerivativeSet, PhotoRecord};
use crate::queue::{EnqueueOptions, JobKind, JobQueue, ProcessingJob};
use crate::storage::{keys, ObjectMetadata, ObjectStore};

/// Decode and encode on the blocking pool, then upload the three renditions
/// under their deterministic keys
pub(crate) async fn render_and_upload(
    store: &dyn ObjectStore,
    settings: DerivativeSettings,
    protocol_id: Uuid,
    photo_id: Uuid,
    original: Vec<u8>,
) -> PipelineResult<(Digest, DerivativeSet)> {
    let generated = render(settings, original).await?;
    let set = upload_renditions(store, protocol_id, photo_id, &generated).await?;
    Ok((generated.original, set))
}

async fn render(
    settings: DerivativeSettings,
    original: Vec<u8>,
) -> PipelineResult<GeneratedDerivatives> {
    tokio::task::spawn_blocking(move || generate_derivatives(&original, &settings))
        .await
        .map_err(|e| PipelineError::Queue(format!("derivative task aborted: {e}")))?
}

async fn upload_renditions(
    store: &dyn ObjectStore,
    protocol_id: Uuid,
    photo_id: Uuid,
    generated: &GeneratedDerivatives,
) -> PipelineResult<DerivativeSet> {
    let keys = keys::derivative_keys(protocol_id, photo_id);
    let mut urls = Renditions::<String>::default();

    for (kind, rendition) in generated.renditions.iter() {
        let metadata: ObjectMetadata = [
            ("photo-id".to_string(), photo_id.to_string()),
            ("protocol-id".to_string(), protocol_id.to_string()),
            ("derivative".to_string(), kind.to_string()),
            ("sha256".to_string(), rendition.digest.sha256.clone()),
            ("original-sha256".to_string(), generated.original.sha256.clone()),
        ]
        .into_iter()
        .collect();

        let url = store
            .put(keys.get(kind), rendition.bytes.clone(), kind.content_type(), &metadata)
            .await?;
        debug!(key = %keys.get(kind), size = rendition.bytes.len(), "Uploaded {kind} rendition");

        match kind {
            DerivativeKind::Thumb => urls.thumb = url,
            DerivativeKind::Gallery => urls.gallery = url,
            DerivativeKind::Pdf => urls.pdf = url,
        }
    }

    Ok(DerivativeSet {
        hashes: generated.renditions.map(|_, r| r.digest.sha256.clone()),
        sizes: generated.renditions.map(|_, r| r.digest.size),
        keys,
        urls,
    })
}

/// Turns one uploaded original into its three renditions
pub struct DerivativeWorker {
    store: Arc<dyn ObjectStore>,
    photos: Arc<dyn PhotoRepository>,
    queue: Arc<dyn JobQueue>,
    settings: DerivativeSettings,
}

impl DerivativeWorker {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        photos: Arc<dyn PhotoRepository>,
        queue: Arc<dyn JobQueue>,
        settings: DerivativeSettings,
    ) -> Self {
        Self {
            store,
            photos,
            queue,
            settings,
        }
    }

    /// Fetch, validate, digest, derive, upload and persist, in that order
    ///
    /// Every write goes to a deterministic key or replaces the whole record,
    /// so running the same job twice leaves the same final state as running
    /// it once.
    #[instrument(skip(self, metadata), fields(job_id = %job_id, photo_id = %photo_id, protocol_id = %protocol_id))]
    pub async fn process(
        &self,
        job_id: Uuid,
        original_key: &str,
        protocol_id: Uuid,
        photo_id: Uuid,
        metadata: &serde_json::Value,
    ) -> PipelineResult<PhotoRecord> {
        let previous = self.photos.get_photo(photo_id).await?;
        if previous.is_some() {
            self.photos
                .set_photo_status(photo_id, PhotoStatus::Processing, None, Some(job_id))
                .await?;
        }
        self.progress(job_id, 10).await;

        let original = self.store.get(original_key).await?;
        let original_size = original.len() as u64;
        self.progress(job_id, 25).await;

        let generated = render(self.settings, original).await?;
        let digest = &generated.original;

        if let Some(expected) = previous
            .as_ref()
            .map(|p| p.original_hash.as_str())
            .filter(|h| !h.is_empty())
        {
            if !expected.eq_ignore_ascii_case(&digest.sha256) {
                return Err(PipelineError::Integrity {
                    expected: expected.to_string(),
                    actual: digest.sha256.clone(),
                    context: format!("original {original_key}"),
                });
            }
        }
        self.progress(job_id, 60).await;

        let derivatives =
            upload_renditions(self.store.as_ref(), protocol_id, photo_id, &generated).await?;
        self.progress(job_id, 90).await;

        // An identical re-run keeps the first completion time.
        let processed_at = previous
            .as_ref()
            .filter(|p| p.status == PhotoStatus::Completed)
            .filter(|p| p.derivatives.as_ref().map(|d| &d.hashes) == Some(&derivatives.hashes))
            .and_then(|p| p.processed_at)
            .unwrap_or_else(Utc::now);

        let mut record = previous.unwrap_or_else(|| {
            PhotoRecord::uploaded(
                photo_id,
                protocol_id,
                digest.sha256.clone(),
                original_key.to_string(),
                self.store.url_for(original_key),
                original_size,
                metadata.clone(),
            )
        });
        record.last_job_id = Some(job_id);
        record.complete(derivatives, processed_at);
        self.photos.upsert_photo(&record).await?;
        self.progress(job_id, 100).await;

        info!(
            original_size,
            derivative_size = record.derivatives.as_ref().map_or(0, DerivativeSet::total_size),
            "Photo processed"
        );

        Ok(record)
    }

    async fn progress(&self, job_id: Uuid, percent: u8) {
        if let Err(e) = self.queue.report_progress(job_id, percent).await {
            warn!(job_id = %job_id, error = %e, "Failed to report progress");
        }
    }
}

/// Routes each [`JobKind`] to the stage that runs it
pub struct JobProcessor {
    derivatives: DerivativeWorker,
    manifests: Arc<ManifestBuilder>,
    migrations: Arc<MigrationOrchestrator>,
    photos: Arc<dyn PhotoRepository>,
    queue: Arc<dyn JobQueue>,
}

impl JobProcessor {
    pub fn new(
        derivatives: DerivativeWorker,
        manifests: Arc<ManifestBuilder>,
        migrations: Arc<MigrationOrchestrator>,
    ) -> Self {
        let photos = derivatives.photos.clone();
        let queue = derivatives.queue.clone();
        Self {
            derivatives,
            manifests,
            migrations,
            photos,
            queue,
        }
    }

    async fn handle_derivative(
        &self,
        job: &ProcessingJob,
        original_key: &str,
        protocol_id: Uuid,
        photo_id: Uuid,
        metadata: &serde_json::Value,
    ) -> PipelineResult<()> {
        match self
            .derivatives
            .process(job.job_id, original_key, protocol_id, photo_id, metadata)
            .await
        {
            Ok(_) => {
                self.enqueue_manifest_if_settled(protocol_id).await;
                Ok(())
            },
            Err(err) => {
                let final_attempt = !err.is_retryable() || !job.attempts_left();
                let status = if final_attempt {
                    PhotoStatus::Failed
                } else {
                    PhotoStatus::Queued
                };
                let message = err.to_string();
                if let Err(e) = self
                    .photos
                    .set_photo_status(photo_id, status, Some(&message), Some(job.job_id))
                    .await
                {
                    warn!(photo_id = %photo_id, error = %e, "Failed to record photo failure");
                }
                if final_attempt {
                    self.enqueue_manifest_if_settled(protocol_id).await;
                }
                Err(err)
            },
        }
    }

    /// Once every photo of the protocol is completed or failed, queue a
    /// manifest build. Duplicate builds are harmless.
    async fn enqueue_manifest_if_settled(&self, protocol_id: Uuid) {
        let photos = match self.photos.list_protocol_photos(protocol_id).await {
            Ok(photos) => photos,
            Err(e) => {
                warn!(protocol_id = %protocol_id, error = %e, "Failed to list protocol photos");
                return;
            },
        };
        if photos.is_empty() || !photos.iter().all(PhotoRecord::is_terminal) {
            return;
        }

        match self
            .queue
            .enqueue(JobKind::GenerateManifest { protocol_id }, EnqueueOptions::default())
            .await
        {
            Ok(job_id) => info!(protocol_id = %protocol_id, job_id = %job_id, "All photos settled, manifest queued"),
            Err(e) => warn!(protocol_id = %protocol_id, error = %e, "Failed to queue manifest"),
        }
    }
}

#[async_trait]
impl JobHandler for JobProcessor {
    #[instrument(skip_all, fields(job_id = %job.job_id, kind = job.kind.name(), attempt = job.attempts))]
    async fn handle(&self, job: &ProcessingJob) -> PipelineResult<()> {
        match &job.kind {
            JobKind::DeriveDerivatives {
                original_key,
                protocol_id,
                photo_id,
                metadata,
            } => {
                self.handle_derivative(job, original_key, *protocol_id, *photo_id, metadata)
                    .await
            },
            JobKind::GenerateManifest { protocol_id } => {
                let published = self.manifests.build(*protocol_id).await?;
                self.queue.report_progress(job.job_id, 100).await?;
                info!(
                    protocol_id = %protocol_id,
                    version = published.manifest.body.version,
                    reused = published.reused,
                    "Manifest ready"
                );
                Ok(())
            },
            JobKind::VerifyManifest { protocol_id } => {
                let report = self.manifests.verify(*protocol_id).await?;
                if !report.is_clean() {
                    warn!(
                        protocol_id = %protocol_id,
                        mismatches = report.mismatches.len(),
                        missing = report.missing.len(),
                        "Manifest verification found problems"
                    );
                }
                Ok(())
            },
            JobKind::MigrateProtocol {
                protocol_id,
                skip_photos,
                skip_pdfs,
            } => {
                self.migrations
                    .migrate_by_id(*protocol_id, *skip_photos, *skip_pdfs)
                    .await
            },
        }
    }

    async fn abandoned(&self, job: &ProcessingJob) -> PipelineResult<()> {
        let JobKind::DeriveDerivatives {
            protocol_id,
            photo_id,
            ..
        } = &job.kind
        else {
            debug!(job_id = %job.job_id, kind = job.kind.name(), "Abandoned job needs no settling");
            return Ok(());
        };

        // The worker may have persisted its result before going silent.
        let completed = self
            .photos
            .get_photo(*photo_id)
            .await?
            .is_some_and(|p| p.status == PhotoStatus::Completed);
        if !completed {
            let message = job
                .error
                .as_deref()
                .unwrap_or("stalled: worker heartbeat lost, no attempts left");
            self.photos
                .set_photo_status(*photo_id, PhotoStatus::Failed, Some(message), Some(job.job_id))
                .await?;
            warn!(photo_id = %photo_id, job_id = %job.job_id, "Photo failed after its worker stalled");
        }
        self.enqueue_manifest_if_settled(*protocol_id).await;
        Ok(())
    }
}
