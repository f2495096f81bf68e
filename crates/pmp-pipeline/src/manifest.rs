//! Manifest Builder
//!
//! A manifest lists every completed photo of a protocol with the hashes and
//! sizes of its original and renditions. It is written once under a key
//! derived from its own hash and never edited; a later build with a
//! different photo set produces a new version under a new key.
//!
//! `manifestHash` is the SHA-256 of the JSON serialization of the manifest
//! without that field, taken over a `serde_json::Value` so object keys are
//! sorted. Any client can recompute it from the downloaded document.

use chrono::{DateTime, Utc};
use pmp_common::checksum::{build_manifest_row, json_sha256, sha256_hex, BlobHash, ManifestRow};
use pmp_common::PhotoStatus;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::db::{PhotoRepository, ProcessingLog};
use crate::error::{PipelineError, PipelineResult};
use crate::models::{PhotoRecord, ProcessingLogEntry};
use crate::storage::{keys, ObjectMetadata, ObjectStore};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestSummary {
    pub photo_count: usize,
    pub total_original_size: u64,
    pub total_derivative_size: u64,
    /// Bytes saved by the renditions relative to the originals
    pub compression_ratio_percent: f64,
}

impl ManifestSummary {
    fn from_rows(rows: &[ManifestRow]) -> Self {
        let total_original_size: u64 = rows.iter().map(|r| r.original_size).sum();
        let total_derivative_size: u64 = rows.iter().map(ManifestRow::total_derivative_size).sum();
        let compression_ratio_percent = if total_original_size == 0 {
            0.0
        } else {
            let saved = total_original_size as f64 - total_derivative_size as f64;
            (saved / total_original_size as f64 * 10_000.0).round() / 100.0
        };
        Self {
            photo_count: rows.len(),
            total_original_size,
            total_derivative_size,
            compression_ratio_percent,
        }
    }
}

/// Manifest content covered by the hash
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestBody {
    pub protocol_id: Uuid,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    /// Completed photos only
    pub photos: Vec<ManifestRow>,
    pub summary: ManifestSummary,
    /// Photos that failed permanently and are left out of `photos`
    pub failed_photo_ids: Vec<Uuid>,
    /// True when every photo of the protocol is in `photos`
    pub complete: bool,
    /// Hash of the photo set, used to skip rebuilding an unchanged manifest
    pub photos_digest: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    #[serde(flatten)]
    pub body: ManifestBody,
    pub manifest_hash: String,
}

impl Manifest {
    pub fn compute_hash(body: &ManifestBody) -> PipelineResult<String> {
        Ok(json_sha256(&serde_json::to_value(body)?)?)
    }

    fn seal(body: ManifestBody) -> PipelineResult<Self> {
        let manifest_hash = Self::compute_hash(&body)?;
        Ok(Self {
            body,
            manifest_hash,
        })
    }

    pub fn from_slice(bytes: &[u8]) -> PipelineResult<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Recompute the hash from the body and compare
    pub fn hash_is_valid(&self) -> bool {
        Self::compute_hash(&self.body).is_ok_and(|h| h == self.manifest_hash)
    }
}

/// A manifest as stored
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedManifest {
    pub manifest: Manifest,
    pub key: String,
    pub url: String,
    /// The photo set was unchanged, so the previous manifest was returned
    pub reused: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HashMismatch {
    pub photo_id: String,
    pub key: String,
    pub expected: String,
    pub actual: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MissingOriginal {
    pub photo_id: String,
    pub key: Option<String>,
}

/// Result of re-hashing every original listed in a manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationReport {
    pub protocol_id: Uuid,
    pub manifest_hash: String,
    pub manifest_hash_valid: bool,
    pub checked: usize,
    pub mismatches: Vec<HashMismatch>,
    pub missing: Vec<MissingOriginal>,
}

impl VerificationReport {
    pub fn is_clean(&self) -> bool {
        self.manifest_hash_valid && self.mismatches.is_empty() && self.missing.is_empty()
    }
}

/// Version claims tried before giving the job back to the queue
const MAX_PUBLISH_ATTEMPTS: u32 = 5;

pub struct ManifestBuilder {
    store: Arc<dyn ObjectStore>,
    photos: Arc<dyn PhotoRepository>,
    log: Arc<dyn ProcessingLog>,
}

fn manifest_row(record: &PhotoRecord) -> Option<ManifestRow> {
    let derivatives = record.derivatives.as_ref()?;
    let hashes = derivatives.hashes.map(|kind, sha256| BlobHash {
        sha256: sha256.clone(),
        size: *derivatives.sizes.get(kind),
    });
    Some(build_manifest_row(
        record.photo_id.to_string(),
        &BlobHash {
            sha256: record.original_hash.clone(),
            size: record.original_size,
        },
        &hashes,
        record.metadata.clone(),
    ))
}

impl ManifestBuilder {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        photos: Arc<dyn PhotoRepository>,
        log: Arc<dyn ProcessingLog>,
    ) -> Self {
        Self { store, photos, log }
    }

    /// Assemble, hash and publish the manifest for `protocol_id`
    ///
    /// Returns the latest manifest unchanged when it already covers the same
    /// photo set. The version is claimed through the processing log; losing
    /// that claim to a concurrent build means trying the next version, or
    /// returning the winner's manifest when it covers the same photos.
    #[instrument(skip(self), fields(protocol_id = %protocol_id))]
    pub async fn build(&self, protocol_id: Uuid) -> PipelineResult<PublishedManifest> {
        let records = self.photos.list_protocol_photos(protocol_id).await?;

        let rows: Vec<ManifestRow> = records.iter().filter_map(manifest_row).collect();
        let failed_photo_ids: Vec<Uuid> = records
            .iter()
            .filter(|r| r.status == PhotoStatus::Failed)
            .map(|r| r.photo_id)
            .collect();
        let complete = rows.len() == records.len();
        let photos_digest = json_sha256(&(&rows, &failed_photo_ids))?;

        let summary = ManifestSummary::from_rows(&rows);
        let mut attempt = 0;
        loop {
            attempt += 1;
            if let Some(existing) = self.reusable(protocol_id, &photos_digest).await? {
                debug!(key = %existing.key, "Photo set unchanged, keeping manifest");
                return Ok(existing);
            }

            let body = ManifestBody {
                protocol_id,
                version: self
                    .log
                    .count(protocol_id, ProcessingLogEntry::MANIFEST_GENERATION)
                    .await?
                    + 1,
                created_at: Utc::now(),
                photos: rows.clone(),
                summary: summary.clone(),
                failed_photo_ids: failed_photo_ids.clone(),
                complete,
                photos_digest: photos_digest.clone(),
            };
            match self.publish(Manifest::seal(body)?).await {
                Err(PipelineError::Conflict(reason)) if attempt < MAX_PUBLISH_ATTEMPTS => {
                    debug!(attempt, reason = %reason, "Manifest version taken, retrying");
                },
                other => return other,
            }
        }
    }

    /// Upload a sealed manifest and claim its version in the processing log
    async fn publish(&self, manifest: Manifest) -> PipelineResult<PublishedManifest> {
        let protocol_id = manifest.body.protocol_id;
        let version = manifest.body.version;
        let key = keys::manifest_key(protocol_id, &manifest.manifest_hash);
        let url = if self.store.exists(&key).await? {
            warn!(key = %key, "Manifest key already present, not overwriting");
            self.store.url_for(&key)
        } else {
            let metadata: ObjectMetadata = [
                ("protocol-id".to_string(), protocol_id.to_string()),
                ("manifest-hash".to_string(), manifest.manifest_hash.clone()),
                ("version".to_string(), version.to_string()),
            ]
            .into_iter()
            .collect();
            self.store
                .put(
                    &key,
                    serde_json::to_vec_pretty(&manifest)?,
                    "application/json",
                    &metadata,
                )
                .await?
        };

        // A losing concurrent builder leaves its upload unreferenced.
        self.log
            .record(&ProcessingLogEntry::completed(
                protocol_id,
                ProcessingLogEntry::MANIFEST_GENERATION,
                Some(url.clone()),
                serde_json::json!({
                    "manifestHash": manifest.manifest_hash,
                    "manifestKey": key,
                    "version": version,
                    "photosDigest": manifest.body.photos_digest,
                    "photoCount": manifest.body.summary.photo_count,
                    "failedPhotoIds": manifest.body.failed_photo_ids,
                    "complete": manifest.body.complete,
                }),
            ))
            .await?;

        info!(
            version,
            photo_count = manifest.body.summary.photo_count,
            failed = manifest.body.failed_photo_ids.len(),
            manifest_hash = %manifest.manifest_hash,
            "Manifest published"
        );

        Ok(PublishedManifest {
            manifest,
            key,
            url,
            reused: false,
        })
    }

    async fn reusable(
        &self,
        protocol_id: Uuid,
        photos_digest: &str,
    ) -> PipelineResult<Option<PublishedManifest>> {
        let Some(entry) = self
            .log
            .latest(protocol_id, ProcessingLogEntry::MANIFEST_GENERATION)
            .await?
        else {
            return Ok(None);
        };
        if entry.metadata["photosDigest"].as_str() != Some(photos_digest) {
            return Ok(None);
        }
        match self.fetch(&entry).await {
            Ok(published) => Ok(Some(PublishedManifest {
                reused: true,
                ..published
            })),
            Err(PipelineError::Storage(e)) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn fetch(&self, entry: &ProcessingLogEntry) -> PipelineResult<PublishedManifest> {
        let key = entry.metadata["manifestKey"]
            .as_str()
            .map(str::to_string)
            .or_else(|| entry.result_url.as_deref().and_then(|u| self.store.key_for_url(u)))
            .ok_or_else(|| {
                PipelineError::NotFound(format!("manifest key for protocol {}", entry.protocol_id))
            })?;
        let bytes = self.store.get(&key).await?;
        Ok(PublishedManifest {
            manifest: Manifest::from_slice(&bytes)?,
            url: self.store.url_for(&key),
            key,
            reused: false,
        })
    }

    /// The most recently published manifest of a protocol
    pub async fn latest(&self, protocol_id: Uuid) -> PipelineResult<Option<PublishedManifest>> {
        match self
            .log
            .latest(protocol_id, ProcessingLogEntry::MANIFEST_GENERATION)
            .await?
        {
            Some(entry) => self.fetch(&entry).await.map(Some),
            None => Ok(None),
        }
    }

    /// Re-fetch every original in the latest manifest and compare hashes
    ///
    /// Problems are reported, never repaired.
    #[instrument(skip(self), fields(protocol_id = %protocol_id))]
    pub async fn verify(&self, protocol_id: Uuid) -> PipelineResult<VerificationReport> {
        let published = self
            .latest(protocol_id)
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("manifest for protocol {protocol_id}")))?;
        let manifest = &published.manifest;

        let mut report = VerificationReport {
            protocol_id,
            manifest_hash: manifest.manifest_hash.clone(),
            manifest_hash_valid: manifest.hash_is_valid(),
            checked: 0,
            mismatches: Vec::new(),
            missing: Vec::new(),
        };

        for row in &manifest.body.photos {
            let record = match row.photo_id.parse::<Uuid>() {
                Ok(photo_id) => self.photos.get_photo(photo_id).await?,
                Err(_) => None,
            };
            let Some(key) = record.map(|r| r.original_key) else {
                report.missing.push(MissingOriginal {
                    photo_id: row.photo_id.clone(),
                    key: None,
                });
                continue;
            };

            match self.store.get(&key).await {
                Ok(bytes) => {
                    report.checked += 1;
                    let actual = sha256_hex(&bytes);
                    if !actual.eq_ignore_ascii_case(&row.original_hash) {
                        report.mismatches.push(HashMismatch {
                            photo_id: row.photo_id.clone(),
                            key,
                            expected: row.original_hash.clone(),
                            actual,
                        });
                    }
                },
                Err(e) if e.is_not_found() => report.missing.push(MissingOriginal {
                    photo_id: row.photo_id.clone(),
                    key: Some(key),
                }),
                Err(e) => return Err(e.into()),
            }
        }

        self.log
            .record(&ProcessingLogEntry::completed(
                protocol_id,
                ProcessingLogEntry::MANIFEST_VERIFICATION,
                Some(published.url.clone()),
                serde_json::to_value(&report)?,
            ))
            .await?;

        if report.is_clean() {
            info!(checked = report.checked, "Manifest verified");
        } else {
            warn!(
                checked = report.checked,
                mismatches = report.mismatches.len(),
                missing = report.missing.len(),
                manifest_hash_valid = report.manifest_hash_valid,
                "Manifest verification found problems"
            );
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryRepository;
    use crate::models::DerivativeSet;
    use crate::storage::MemoryStore;
    use pmp_common::Renditions;

    async fn completed_photo(
        repo: &MemoryRepository,
        store: &MemoryStore,
        protocol_id: Uuid,
        bytes: &[u8],
    ) -> PhotoRecord {
        let photo_id = Uuid::new_v4();
        let key = keys::original_key(protocol_id, photo_id, "jpg");
        let url = store
            .put(&key, bytes.to_vec(), "image/jpeg", &ObjectMetadata::new())
            .await
            .unwrap();
        let mut record = PhotoRecord::uploaded(
            photo_id,
            protocol_id,
            sha256_hex(bytes),
            key,
            url,
            1000,
            serde_json::json!({}),
        );
        record.complete(
            DerivativeSet {
                hashes: Renditions {
                    thumb: "1".repeat(64),
                    gallery: "2".repeat(64),
                    pdf: "3".repeat(64),
                },
                sizes: Renditions {
                    thumb: 50,
                    gallery: 300,
                    pdf: 200,
                },
                keys: keys::derivative_keys(protocol_id, photo_id),
                urls: Renditions::default(),
            },
            Utc::now(),
        );
        repo.upsert_photo(&record).await.unwrap();
        record
    }

    fn builder(store: &Arc<MemoryStore>, repo: &Arc<MemoryRepository>) -> ManifestBuilder {
        ManifestBuilder::new(store.clone(), repo.clone(), repo.clone())
    }

    #[test]
    fn test_summary_ratio() {
        let row = build_manifest_row(
            "p",
            &BlobHash { sha256: "a".into(), size: 1000 },
            &Renditions {
                thumb: BlobHash { sha256: "b".into(), size: 50 },
                gallery: BlobHash { sha256: "c".into(), size: 300 },
                pdf: BlobHash { sha256: "d".into(), size: 200 },
            },
            serde_json::Value::Null,
        );
        let summary = ManifestSummary::from_rows(&[row]);
        assert_eq!(summary.total_derivative_size, 550);
        assert_eq!(summary.compression_ratio_percent, 45.0);
        assert_eq!(ManifestSummary::from_rows(&[]).compression_ratio_percent, 0.0);
    }

    #[tokio::test]
    async fn test_build_is_idempotent_for_same_photo_set() {
        let store = Arc::new(MemoryStore::default());
        let repo = Arc::new(MemoryRepository::new());
        let protocol_id = Uuid::new_v4();
        completed_photo(&repo, &store, protocol_id, b"one").await;

        let first = builder(&store, &repo).build(protocol_id).await.unwrap();
        assert!(!first.reused);
        assert_eq!(first.manifest.body.version, 1);
        assert!(first.manifest.body.complete);

        let second = builder(&store, &repo).build(protocol_id).await.unwrap();
        assert!(second.reused);
        assert_eq!(second.manifest, first.manifest);

        completed_photo(&repo, &store, protocol_id, b"two").await;
        let third = builder(&store, &repo).build(protocol_id).await.unwrap();
        assert_eq!(third.manifest.body.version, 2);
        assert_ne!(third.key, first.key);
        assert!(store.exists(&first.key).await.unwrap(), "old version is kept");
    }

    #[tokio::test]
    async fn test_downloaded_manifest_hash_recomputes() {
        let store = Arc::new(MemoryStore::default());
        let repo = Arc::new(MemoryRepository::new());
        let protocol_id = Uuid::new_v4();
        completed_photo(&repo, &store, protocol_id, b"front").await;

        let published = builder(&store, &repo).build(protocol_id).await.unwrap();
        let bytes = store.get(&published.key).await.unwrap();

        let mut json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        let stored_hash = json["manifestHash"].as_str().unwrap().to_string();
        json.as_object_mut().unwrap().remove("manifestHash");
        assert_eq!(json_sha256(&json).unwrap(), stored_hash);
        assert!(published.key.ends_with(&format!("manifest_{}.json", &stored_hash[..16])));
    }

    #[tokio::test]
    async fn test_verify_reports_corruption_and_missing() {
        let store = Arc::new(MemoryStore::default());
        let repo = Arc::new(MemoryRepository::new());
        let protocol_id = Uuid::new_v4();
        let good = completed_photo(&repo, &store, protocol_id, b"good").await;
        let bad = completed_photo(&repo, &store, protocol_id, b"bad").await;
        let gone = completed_photo(&repo, &store, protocol_id, b"gone").await;

        let builder = builder(&store, &repo);
        builder.build(protocol_id).await.unwrap();
        assert!(builder.verify(protocol_id).await.unwrap().is_clean());

        store.corrupt(&bad.original_key, b"tampered".to_vec()).await;
        store.delete(&gone.original_key).await.unwrap();

        let report = builder.verify(protocol_id).await.unwrap();
        assert_eq!(report.checked, 2);
        assert_eq!(report.mismatches.len(), 1);
        assert_eq!(report.mismatches[0].photo_id, bad.photo_id.to_string());
        assert_eq!(report.missing.len(), 1);
        assert_eq!(report.missing[0].photo_id, gone.photo_id.to_string());
        assert!(report.manifest_hash_valid);
        assert!(!report.is_clean());

        // Nothing is repaired.
        assert_eq!(store.get(&bad.original_key).await.unwrap(), b"tampered");
        assert_eq!(repo.get_photo(good.photo_id).await.unwrap().unwrap(), good);
        assert_eq!(
            repo.count(protocol_id, ProcessingLogEntry::MANIFEST_VERIFICATION).await.unwrap(),
            2
        );
    }

    #[tokio::test]
    async fn test_verify_without_manifest() {
        let store = Arc::new(MemoryStore::default());
        let repo = Arc::new(MemoryRepository::new());
        assert!(matches!(
            builder(&store, &repo).verify(Uuid::new_v4()).await,
            Err(PipelineError::NotFound(_))
        ));
    }

    /// Processing log whose first `count` misses the newest entry, as when
    /// another builder records between our read and our write
    struct LaggingLog {
        inner: Arc<MemoryRepository>,
        lagged: std::sync::atomic::AtomicBool,
    }

    #[async_trait::async_trait]
    impl ProcessingLog for LaggingLog {
        async fn record(&self, entry: &ProcessingLogEntry) -> PipelineResult<()> {
            self.inner.record(entry).await
        }

        async fn latest(
            &self,
            protocol_id: Uuid,
            job_type: &str,
        ) -> PipelineResult<Option<ProcessingLogEntry>> {
            self.inner.latest(protocol_id, job_type).await
        }

        async fn count(&self, protocol_id: Uuid, job_type: &str) -> PipelineResult<u64> {
            let count = self.inner.count(protocol_id, job_type).await?;
            if self.lagged.swap(true, std::sync::atomic::Ordering::SeqCst) {
                Ok(count)
            } else {
                Ok(count.saturating_sub(1))
            }
        }
    }

    fn logged_versions(entries: &[ProcessingLogEntry]) -> Vec<u64> {
        let mut versions: Vec<u64> = entries.iter().filter_map(|e| e.manifest_version()).collect();
        versions.sort_unstable();
        versions
    }

    #[tokio::test]
    async fn test_version_taken_by_concurrent_build_moves_to_next() {
        let store = Arc::new(MemoryStore::default());
        let repo = Arc::new(MemoryRepository::new());
        let protocol_id = Uuid::new_v4();
        completed_photo(&repo, &store, protocol_id, b"one").await;
        builder(&store, &repo).build(protocol_id).await.unwrap();

        completed_photo(&repo, &store, protocol_id, b"two").await;
        let lagging = ManifestBuilder::new(
            store.clone(),
            repo.clone(),
            Arc::new(LaggingLog {
                inner: repo.clone(),
                lagged: std::sync::atomic::AtomicBool::new(false),
            }),
        );
        let published = lagging.build(protocol_id).await.unwrap();

        assert_eq!(published.manifest.body.version, 2);
        assert_eq!(published.manifest.body.photos.len(), 2);
        assert!(published.manifest.hash_is_valid());
        assert_eq!(logged_versions(&repo.log_entries(protocol_id).await), vec![1, 2]);
        let latest = builder(&store, &repo).latest(protocol_id).await.unwrap().unwrap();
        assert_eq!(latest.manifest, published.manifest);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_builds_share_one_version() {
        let store = Arc::new(MemoryStore::default());
        let repo = Arc::new(MemoryRepository::new());
        let protocol_id = Uuid::new_v4();
        for n in 0..3u8 {
            completed_photo(&repo, &store, protocol_id, &[n; 16]).await;
        }

        let builds: Vec<_> = (0..4)
            .map(|_| {
                let builder = builder(&store, &repo);
                tokio::spawn(async move { builder.build(protocol_id).await })
            })
            .collect();
        let mut hashes = Vec::new();
        for build in builds {
            hashes.push(build.await.unwrap().unwrap().manifest.manifest_hash);
        }

        hashes.dedup();
        assert_eq!(hashes.len(), 1);
        assert_eq!(logged_versions(&repo.log_entries(protocol_id).await), vec![1]);
    }
}
