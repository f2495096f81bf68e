//! S3 store integration tests
//!
//! **Requirements**:
//! - MinIO or S3 must be running with the configured bucket created
//! - S3_ENDPOINT environment variable must be set (e.g., "http://localhost:9000")
//! - Tests are skipped if S3_ENDPOINT is not configured
//!
//! ```bash
//! S3_ENDPOINT=http://localhost:9000 S3_PATH_STYLE=true cargo test --test s3_store_tests
//! ```

use pmp_pipeline::error::StorageErrorKind;
use pmp_pipeline::storage::config::StorageConfig;
use pmp_pipeline::storage::{ObjectMetadata, ObjectStore, S3Store};
use uuid::Uuid;

fn setup_store() -> Option<S3Store> {
    if std::env::var("S3_ENDPOINT").is_err() {
        return None;
    }
    let config = StorageConfig::from_env().ok()?;
    Some(S3Store::new(&config))
}

fn test_prefix(test_name: &str) -> String {
    format!("test/{}/{}/", test_name, Uuid::new_v4())
}

#[tokio::test]
async fn test_put_get_overwrite() {
    let Some(store) = setup_store() else {
        eprintln!("Skipping test_put_get_overwrite: S3_ENDPOINT not set");
        return;
    };
    let key = format!("{}original.jpg", test_prefix("put_get"));
    let metadata: ObjectMetadata = [("sha256".to_string(), "abc".to_string())].into_iter().collect();

    let url = store.put(&key, b"first".to_vec(), "image/jpeg", &metadata).await.unwrap();
    assert!(url.ends_with(&key));
    assert_eq!(store.key_for_url(&url).as_deref(), Some(key.as_str()));

    store.put(&key, b"second".to_vec(), "image/jpeg", &metadata).await.unwrap();
    assert_eq!(store.get(&key).await.unwrap(), b"second");
    assert!(store.exists(&key).await.unwrap());

    store.delete(&key).await.unwrap();
    assert!(!store.exists(&key).await.unwrap());
}

#[tokio::test]
async fn test_missing_key_is_not_found() {
    let Some(store) = setup_store() else {
        eprintln!("Skipping test_missing_key_is_not_found: S3_ENDPOINT not set");
        return;
    };
    let key = format!("{}absent.jpg", test_prefix("missing"));

    let err = store.get(&key).await.unwrap_err();
    assert_eq!(err.kind, StorageErrorKind::NotFound);
    // Deleting a missing key succeeds
    store.delete(&key).await.unwrap();
}

#[tokio::test]
async fn test_list_and_delete_prefix() {
    let Some(store) = setup_store() else {
        eprintln!("Skipping test_list_and_delete_prefix: S3_ENDPOINT not set");
        return;
    };
    let prefix = test_prefix("prefix");
    for name in ["b.jpg", "a.jpg", "c.webp"] {
        store
            .put(&format!("{prefix}{name}"), name.as_bytes().to_vec(), "image/jpeg", &ObjectMetadata::new())
            .await
            .unwrap();
    }

    let listed = store.list(&prefix).await.unwrap();
    assert_eq!(
        listed,
        vec![format!("{prefix}a.jpg"), format!("{prefix}b.jpg"), format!("{prefix}c.webp")]
    );

    assert_eq!(store.delete_prefix(&prefix).await.unwrap(), 3);
    assert!(store.list(&prefix).await.unwrap().is_empty());
}
