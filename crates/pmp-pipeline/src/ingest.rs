//! Ingestion Gateway
//!
//! The synchronous half of an upload: check the type and size, store the
//! original, create the photo record and queue the derivative job. Everything
//! after that is observable only through [`IngestionGateway::photo_status`].

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use pmp_common::checksum::digest;
use pmp_common::{PhotoStatus, Renditions};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::config::IngestConfig;
use crate::db::PhotoRepository;
use crate::error::{PipelineError, PipelineResult};
use crate::models::PhotoRecord;
use crate::queue::{EnqueueOptions, JobKind, JobQueue, JobState};
use crate::storage::{keys, ObjectMetadata, ObjectStore};

#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub protocol_id: Uuid,
    pub filename: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
    pub user_id: Option<String>,
    /// Caller metadata stored on the photo record; must be a JSON object or null
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadReceipt {
    pub photo_id: Uuid,
    pub original_url: String,
    pub job_id: Uuid,
}

/// Result of one request in a bulk upload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadOutcome {
    pub filename: String,
    pub result: Result<UploadReceipt, String>,
}

/// What a status poll sees of a photo
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhotoStatusReport {
    pub photo_id: Uuid,
    pub protocol_id: Uuid,
    pub status: PhotoStatus,
    /// Live job progress while processing, 100 once completed, else 0
    pub progress: u8,
    pub original_url: String,
    pub urls: Option<Renditions<String>>,
    pub metadata: serde_json::Value,
    pub error: Option<String>,
    pub job_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

pub struct IngestionGateway {
    store: Arc<dyn ObjectStore>,
    photos: Arc<dyn PhotoRepository>,
    queue: Arc<dyn JobQueue>,
    config: IngestConfig,
}

impl IngestionGateway {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        photos: Arc<dyn PhotoRepository>,
        queue: Arc<dyn JobQueue>,
        config: IngestConfig,
    ) -> Self {
        Self {
            store,
            photos,
            queue,
            config,
        }
    }

    /// Store the original and queue its derivative job
    #[instrument(skip(self, request), fields(protocol_id = %request.protocol_id, filename = %request.filename, size = request.bytes.len()))]
    pub async fn ingest(&self, request: UploadRequest) -> PipelineResult<UploadReceipt> {
        let extension = keys::extension_for_mime(&request.mime_type).ok_or_else(|| {
            PipelineError::validation(format!("Unsupported file type: {}", request.mime_type))
        })?;
        if request.bytes.is_empty() {
            return Err(PipelineError::validation("Empty upload"));
        }
        if request.bytes.len() > self.config.max_upload_bytes {
            return Err(PipelineError::validation(format!(
                "File too large: {} bytes (max {} bytes)",
                request.bytes.len(),
                self.config.max_upload_bytes
            )));
        }

        let photo_id = Uuid::new_v4();
        let protocol_id = request.protocol_id;
        let original_key = keys::original_key(protocol_id, photo_id, extension);
        let original = digest(&request.bytes);

        let mut object_metadata: ObjectMetadata = [
            ("photo-id".to_string(), photo_id.to_string()),
            ("protocol-id".to_string(), protocol_id.to_string()),
            ("sha256".to_string(), original.sha256.clone()),
            ("original-filename".to_string(), request.filename.clone()),
        ]
        .into_iter()
        .collect();
        if let Some(user_id) = &request.user_id {
            object_metadata.insert("user-id".to_string(), user_id.clone());
        }

        let original_url = self
            .store
            .put(&original_key, request.bytes, &request.mime_type, &object_metadata)
            .await?;

        let mut record = PhotoRecord::uploaded(
            photo_id,
            protocol_id,
            original.sha256,
            original_key.clone(),
            original_url.clone(),
            original.size,
            record_metadata(&request.filename, &request.mime_type, request.user_id, request.metadata),
        );
        // Written before the job exists: once enqueued, only the worker
        // changes the status.
        record.status = PhotoStatus::Queued;
        self.photos.upsert_photo(&record).await?;

        let enqueued = self
            .queue
            .enqueue(
                JobKind::DeriveDerivatives {
                    original_key,
                    protocol_id,
                    photo_id,
                    metadata: record.metadata.clone(),
                },
                EnqueueOptions::default(),
            )
            .await;
        let job_id = match enqueued {
            Ok(job_id) => job_id,
            Err(err) => {
                let message = format!("Failed to queue derivatives: {err}");
                if let Err(e) = self
                    .photos
                    .set_photo_status(photo_id, PhotoStatus::Failed, Some(&message), None)
                    .await
                {
                    warn!(photo_id = %photo_id, error = %e, "Failed to record enqueue failure");
                }
                return Err(err);
            },
        };
        self.photos.attach_job(photo_id, job_id).await?;

        info!(photo_id = %photo_id, job_id = %job_id, "Original stored, derivatives queued");

        Ok(UploadReceipt {
            photo_id,
            original_url,
            job_id,
        })
    }

    /// Ingest several uploads with bounded fan-out
    ///
    /// Outcomes come back in request order; one failure does not affect the
    /// others.
    pub async fn upload_many(&self, requests: Vec<UploadRequest>) -> Vec<UploadOutcome> {
        let concurrency = self.config.upload_concurrency.max(1);
        let outcomes: Vec<UploadOutcome> = stream::iter(requests)
            .map(|request| async move {
                let filename = request.filename.clone();
                let result = self.ingest(request).await.map_err(|e| {
                    warn!(filename = %filename, error = %e, "Upload failed");
                    e.to_string()
                });
                UploadOutcome { filename, result }
            })
            .buffered(concurrency)
            .collect()
            .await;

        let failed = outcomes.iter().filter(|o| o.result.is_err()).count();
        info!(total = outcomes.len(), failed, "Bulk upload finished");
        outcomes
    }

    pub async fn photo_status(&self, photo_id: Uuid) -> PipelineResult<PhotoStatusReport> {
        let record = self
            .photos
            .get_photo(photo_id)
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("photo {photo_id}")))?;

        let progress = match record.status {
            PhotoStatus::Completed => 100,
            PhotoStatus::Processing => match record.last_job_id {
                Some(job_id) => self
                    .queue
                    .get(job_id)
                    .await?
                    .filter(|job| job.state == JobState::Active)
                    .map_or(0, |job| job.progress),
                None => 0,
            },
            _ => 0,
        };

        Ok(PhotoStatusReport {
            photo_id: record.photo_id,
            protocol_id: record.protocol_id,
            status: record.status,
            progress,
            original_url: record.original_url,
            urls: record.derivatives.map(|d| d.urls),
            metadata: record.metadata,
            error: record.error,
            job_id: record.last_job_id,
            created_at: record.created_at,
            processed_at: record.processed_at,
        })
    }
}

fn record_metadata(
    filename: &str,
    mime_type: &str,
    user_id: Option<String>,
    extra: serde_json::Value,
) -> serde_json::Value {
    let mut metadata = match extra {
        serde_json::Value::Object(map) => map,
        serde_json::Value::Null => serde_json::Map::new(),
        other => {
            let mut map = serde_json::Map::new();
            map.insert("value".to_string(), other);
            map
        },
    };
    metadata.insert("filename".to_string(), filename.into());
    metadata.insert("mimeType".to_string(), mime_type.into());
    if let Some(user_id) = user_id {
        metadata.insert("userId".to_string(), user_id.into());
    }
    serde_json::Value::Object(metadata)
}
