use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::RwLock;

use super::{ObjectMetadata, ObjectStore, StorageResult};
use crate::error::StorageError;

#[derive(Debug, Clone)]
pub struct StoredObject {
    pub bytes: Vec<u8>,
    pub content_type: String,
    pub metadata: ObjectMetadata,
}

/// In-process object store
///
/// Keeps objects in a sorted map so `list` returns keys in lexical order, the
/// way S3 does. `set_unavailable` makes every call fail with a transient error.
#[derive(Debug)]
pub struct MemoryStore {
    objects: RwLock<BTreeMap<String, StoredObject>>,
    url_base: String,
    unavailable: AtomicBool,
    puts: AtomicUsize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new("memory://protocol-media")
    }
}

impl MemoryStore {
    pub fn new(url_base: impl Into<String>) -> Self {
        Self {
            objects: RwLock::new(BTreeMap::new()),
            url_base: url_base.into().trim_end_matches('/').to_string(),
            unavailable: AtomicBool::new(false),
            puts: AtomicUsize::new(0),
        }
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of successful `put` calls so far
    pub fn put_count(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    pub async fn object(&self, key: &str) -> Option<StoredObject> {
        self.objects.read().await.get(key).cloned()
    }

    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.objects.read().await.is_empty()
    }

    /// Overwrite an object in place without going through `put`
    pub async fn corrupt(&self, key: &str, bytes: Vec<u8>) -> bool {
        match self.objects.write().await.get_mut(key) {
            Some(obj) => {
                obj.bytes = bytes;
                true
            },
            None => false,
        }
    }

    fn check_available(&self, key: &str) -> StorageResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(StorageError::transient(format!("{key}: store unavailable")))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn put(
        &self,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
        metadata: &ObjectMetadata,
    ) -> StorageResult<String> {
        self.check_available(key)?;
        if key.is_empty() {
            return Err(StorageError::permanent("object key cannot be empty"));
        }
        self.objects.write().await.insert(
            key.to_string(),
            StoredObject {
                bytes,
                content_type: content_type.to_string(),
                metadata: metadata.clone(),
            },
        );
        self.puts.fetch_add(1, Ordering::SeqCst);
        Ok(self.url_for(key))
    }

    async fn get(&self, key: &str) -> StorageResult<Vec<u8>> {
        self.check_available(key)?;
        self.objects
            .read()
            .await
            .get(key)
            .map(|obj| obj.bytes.clone())
            .ok_or_else(|| StorageError::not_found(key))
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        self.check_available(key)?;
        self.objects.write().await.remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>> {
        self.check_available(prefix)?;
        Ok(self
            .objects
            .read()
            .await
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.clone())
            .collect())
    }

    async fn exists(&self, key: &str) -> StorageResult<bool> {
        self.check_available(key)?;
        Ok(self.objects.read().await.contains_key(key))
    }

    fn url_base(&self) -> &str {
        &self.url_base
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    #[tokio::test]
    async fn test_put_overwrites_and_get_returns_latest() {
        let store = MemoryStore::default();
        let meta = ObjectMetadata::new();

        let url = store.put("a/1.jpg", b"one".to_vec(), "image/jpeg", &meta).await.unwrap();
        store.put("a/1.jpg", b"two".to_vec(), "image/jpeg", &meta).await.unwrap();

        assert_eq!(url, "memory://protocol-media/a/1.jpg");
        assert_eq!(store.get("a/1.jpg").await.unwrap(), b"two");
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_missing_key_is_not_found() {
        let store = MemoryStore::default();
        let err = store.get("nope").await.unwrap_err();
        assert!(err.is_not_found());
        assert!(!store.exists("nope").await.unwrap());
        assert_ok!(store.delete("nope").await);
    }

    #[tokio::test]
    async fn test_list_and_delete_by_prefix() {
        let store = MemoryStore::default();
        let meta = ObjectMetadata::new();
        for key in ["protocols/a/x.jpg", "protocols/a/y.jpg", "protocols/ab/z.jpg", "protocols/b/w.jpg"] {
            store.put(key, vec![1], "image/jpeg", &meta).await.unwrap();
        }

        assert_eq!(
            store.list("protocols/a/").await.unwrap(),
            vec!["protocols/a/x.jpg", "protocols/a/y.jpg"]
        );
        assert_eq!(store.delete_prefix("protocols/a/").await.unwrap(), 2);
        assert_eq!(store.len().await, 2);
    }

    #[tokio::test]
    async fn test_unavailable_store_fails_transiently() {
        let store = MemoryStore::default();
        store.set_unavailable(true);
        let err = store.get("k").await.unwrap_err();
        assert_eq!(err.kind, crate::error::StorageErrorKind::Transient);

        assert_err!(store.list("").await);

        store.set_unavailable(false);
        assert!(store.get("k").await.unwrap_err().is_not_found());
    }
}
