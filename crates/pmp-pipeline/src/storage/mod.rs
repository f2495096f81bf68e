//! Object Store Adapter
//!
//! Blob put/get/delete/list behind the [`ObjectStore`] trait. Production uses
//! [`S3Store`] (AWS S3, MinIO or Cloudflare R2); tests and local tooling use
//! [`MemoryStore`].

use async_trait::async_trait;
use std::collections::HashMap;

use crate::error::StorageError;

pub mod config;
pub mod keys;
mod memory;
mod s3;

pub use memory::MemoryStore;
pub use s3::S3Store;

pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// User metadata attached to a stored object
pub type ObjectMetadata = HashMap<String, String>;

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Write `bytes` under `key`, replacing any previous object, and return
    /// its public url
    async fn put(
        &self,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
        metadata: &ObjectMetadata,
    ) -> StorageResult<String>;

    /// Fails with a `NotFound` [`StorageError`] when the key is absent
    async fn get(&self, key: &str) -> StorageResult<Vec<u8>>;

    /// Deleting a missing key succeeds
    async fn delete(&self, key: &str) -> StorageResult<()>;

    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>>;

    async fn exists(&self, key: &str) -> StorageResult<bool>;

    /// Prefix that keys are appended to when building urls
    fn url_base(&self) -> &str;

    fn url_for(&self, key: &str) -> String {
        format!("{}/{}", self.url_base(), key)
    }

    /// Recover the key of a url produced by [`ObjectStore::url_for`]
    fn key_for_url(&self, url: &str) -> Option<String> {
        url.strip_prefix(self.url_base())
            .map(|rest| rest.trim_start_matches('/'))
            .filter(|key| !key.is_empty())
            .map(str::to_string)
    }

    /// Delete everything under `prefix`, returning the number of objects removed
    async fn delete_prefix(&self, prefix: &str) -> StorageResult<usize> {
        let keys = self.list(prefix).await?;
        for key in &keys {
            self.delete(key).await?;
        }
        Ok(keys.len())
    }
}
