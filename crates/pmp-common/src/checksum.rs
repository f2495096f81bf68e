//! Integrity utilities for photos, derivatives and manifests
//!
//! Everything here is pure: callers hand in bytes already in memory and get
//! hex digests back. Hex output is always lowercase; comparisons accept either
//! case so hashes copied from other tools still verify.

use crate::error::{CommonError, Result};
use crate::types::Renditions;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

/// Digest of a single blob
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Digest {
    /// 64-character lowercase hex
    pub sha256: String,
    /// 32-character lowercase hex, kept for legacy tooling
    pub md5: String,
    pub size: u64,
    pub timestamp: DateTime<Utc>,
}

/// Hash and size of a blob, as recorded in photo records and manifests
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobHash {
    pub sha256: String,
    pub size: u64,
}

impl From<&Digest> for BlobHash {
    fn from(d: &Digest) -> Self {
        Self {
            sha256: d.sha256.clone(),
            size: d.size,
        }
    }
}

/// Compute SHA-256 and MD5 of `bytes`
pub fn digest(bytes: &[u8]) -> Digest {
    Digest {
        sha256: sha256_hex(bytes),
        md5: md5_hex(bytes),
        size: bytes.len() as u64,
        timestamp: Utc::now(),
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

pub fn md5_hex(bytes: &[u8]) -> String {
    format!("{:x}", md5::compute(bytes))
}

/// Check `bytes` against an expected SHA-256 hex string
pub fn verify(bytes: &[u8], expected_sha256: &str) -> bool {
    sha256_hex(bytes).eq_ignore_ascii_case(expected_sha256.trim())
}

/// Like [`verify`] but reports the actual hash on mismatch
pub fn verify_strict(bytes: &[u8], expected_sha256: &str) -> Result<()> {
    let actual = sha256_hex(bytes);
    if actual.eq_ignore_ascii_case(expected_sha256.trim()) {
        Ok(())
    } else {
        Err(CommonError::ChecksumMismatch {
            expected: expected_sha256.to_string(),
            actual,
        })
    }
}

/// Byte-identity proxy: two blobs are duplicates iff their SHA-256 match
///
/// This compares two known digests. It is not a lookup against everything
/// already stored.
pub fn is_duplicate(a: &Digest, b: &Digest) -> bool {
    a.size == b.size && a.sha256.eq_ignore_ascii_case(&b.sha256)
}

/// One photo entry of a protocol manifest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestRow {
    pub photo_id: String,
    pub original_hash: String,
    pub original_size: u64,
    pub derivative_hashes: Renditions<String>,
    pub derivative_sizes: Renditions<u64>,
    pub metadata: serde_json::Value,
}

impl ManifestRow {
    pub fn total_derivative_size(&self) -> u64 {
        self.derivative_sizes.iter().map(|(_, size)| *size).sum()
    }
}

pub fn build_manifest_row(
    photo_id: impl Into<String>,
    original: &BlobHash,
    derivatives: &Renditions<BlobHash>,
    metadata: serde_json::Value,
) -> ManifestRow {
    ManifestRow {
        photo_id: photo_id.into(),
        original_hash: original.sha256.to_lowercase(),
        original_size: original.size,
        derivative_hashes: derivatives.map(|_, h| h.sha256.to_lowercase()),
        derivative_sizes: derivatives.map(|_, h| h.size),
        metadata,
    }
}

/// SHA-256 over the JSON serialization of `value`
///
/// `serde_json` writes struct fields in declaration order and `Value` objects
/// in key order, so the output is stable for a given value.
pub fn json_sha256<T: Serialize>(value: &T) -> Result<String> {
    let bytes = serde_json::to_vec(value)?;
    Ok(sha256_hex(&bytes))
}
