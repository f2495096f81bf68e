use async_trait::async_trait;
use aws_sdk_s3::{
    config::{http::HttpResponse, timeout::TimeoutConfig, Credentials, Region},
    error::{DisplayErrorContext, ProvideErrorMetadata, SdkError},
    primitives::ByteStream,
    Client,
};
use std::time::Duration;
use tracing::{debug, info, instrument};

use super::config::StorageConfig;
use super::{ObjectMetadata, ObjectStore, StorageResult};
use crate::error::StorageError;

/// S3-compatible object store
#[derive(Clone)]
pub struct S3Store {
    client: Client,
    bucket: String,
    url_base: String,
}

impl S3Store {
    pub fn new(config: &StorageConfig) -> Self {
        debug!(bucket = %config.bucket, endpoint = ?config.endpoint, "Initializing S3 store");

        let credentials = Credentials::new(
            &config.access_key,
            &config.secret_key,
            None,
            None,
            "pmp-storage",
        );

        let timeouts = TimeoutConfig::builder()
            .operation_timeout(Duration::from_secs(config.timeout_secs))
            .build();

        let mut builder = aws_sdk_s3::Config::builder()
            .credentials_provider(credentials)
            .region(Region::new(config.region.clone()))
            .force_path_style(config.path_style)
            .timeout_config(timeouts);

        if let Some(endpoint) = &config.endpoint {
            builder = builder.endpoint_url(endpoint);
        }

        let client = Client::from_conf(builder.build());

        info!(bucket = %config.bucket, "S3 store initialized");

        Self {
            client,
            bucket: config.bucket.clone(),
            url_base: config.url_base(),
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }
}

/// Map an SDK failure onto the transient / permanent / not-found split
fn classify<E>(err: SdkError<E, HttpResponse>, key: &str) -> StorageError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    let status = err.raw_response().map(|r| r.status().as_u16());
    let code = err.code().map(str::to_string);
    let message = format!("{key}: {}", DisplayErrorContext(&err));

    match err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
            StorageError::transient(message)
        },
        SdkError::ConstructionFailure(_) => StorageError::permanent(message),
        SdkError::ServiceError(_) => {
            let not_found = matches!(status, Some(404))
                || matches!(code.as_deref(), Some("NoSuchKey" | "NotFound"));
            match status {
                _ if not_found => StorageError::not_found(key),
                Some(s) if s >= 500 || s == 429 => StorageError::transient(message),
                _ if matches!(code.as_deref(), Some("SlowDown" | "RequestTimeout")) => {
                    StorageError::transient(message)
                },
                _ => StorageError::permanent(message),
            }
        },
        _ => StorageError::transient(message),
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    #[instrument(skip(self, bytes, metadata), fields(size = bytes.len()))]
    async fn put(
        &self,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
        metadata: &ObjectMetadata,
    ) -> StorageResult<String> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .set_metadata(Some(metadata.clone()))
            .body(ByteStream::from(bytes))
            .send()
            .await
            .map_err(|e| classify(e, key))?;

        debug!("Uploaded s3://{}/{}", self.bucket, key);

        Ok(self.url_for(key))
    }

    #[instrument(skip(self))]
    async fn get(&self, key: &str) -> StorageResult<Vec<u8>> {
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| classify(e, key))?;

        let data = response
            .body
            .collect()
            .await
            .map_err(|e| StorageError::transient(format!("{key}: failed to read body: {e}")))?
            .into_bytes()
            .to_vec();

        debug!("Downloaded {} bytes from s3://{}/{}", data.len(), self.bucket, key);

        Ok(data)
    }

    #[instrument(skip(self))]
    async fn delete(&self, key: &str) -> StorageResult<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| classify(e, key))?;

        debug!("Deleted s3://{}/{}", self.bucket, key);

        Ok(())
    }

    #[instrument(skip(self))]
    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>> {
        let mut keys = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let response = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix)
                .set_continuation_token(continuation.take())
                .send()
                .await
                .map_err(|e| classify(e, prefix))?;

            keys.extend(
                response
                    .contents()
                    .iter()
                    .filter_map(|obj| obj.key().map(str::to_string)),
            );

            match response.next_continuation_token() {
                Some(token) => continuation = Some(token.to_string()),
                None => break,
            }
        }

        Ok(keys)
    }

    #[instrument(skip(self))]
    async fn exists(&self, key: &str) -> StorageResult<bool> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => match classify(e, key) {
                err if err.is_not_found() => Ok(false),
                err => Err(err),
            },
        }
    }

    fn url_base(&self) -> &str {
        &self.url_base
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_urls_round_trip_through_keys() {
        let store = S3Store::new(&StorageConfig::for_minio("http://localhost:9000", "media"));
        let url = store.url_for("protocols/p/photos/thumb/x.webp");
        assert_eq!(url, "http://localhost:9000/media/protocols/p/photos/thumb/x.webp");
        assert_eq!(
            store.key_for_url(&url).as_deref(),
            Some("protocols/p/photos/thumb/x.webp")
        );
        assert_eq!(store.key_for_url("https://elsewhere.example.com/x.jpg"), None);
    }
}
