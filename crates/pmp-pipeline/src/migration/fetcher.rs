use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::error::{PipelineError, PipelineResult};
use crate::storage::ObjectStore;

/// Downloads legacy photos and documents
///
/// Urls that point into the legacy bucket (their path contains the bucket
/// marker segment) are read straight from the object store; anything else is
/// fetched over HTTP.
pub struct LegacyFetcher {
    http: reqwest::Client,
    store: Arc<dyn ObjectStore>,
    bucket_marker: String,
}

impl LegacyFetcher {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        bucket_marker: impl Into<String>,
        timeout: Duration,
    ) -> PipelineResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("pmp-migration/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            http,
            store,
            bucket_marker: bucket_marker.into(),
        })
    }

    /// Object key inside the legacy bucket, if `url` points there
    pub fn legacy_key(&self, url: &str) -> Option<String> {
        if self.bucket_marker.is_empty() {
            return None;
        }
        let parsed = Url::parse(url).ok()?;
        let segments: Vec<&str> = parsed.path_segments()?.collect();
        let start = segments.iter().position(|s| *s == self.bucket_marker)? + 1;
        let key = segments[start..].join("/");
        (!key.is_empty()).then_some(key)
    }

    pub async fn fetch(&self, url: &str) -> PipelineResult<Vec<u8>> {
        if let Some(key) = self.legacy_key(url) {
            debug!(key = %key, "Reading legacy object from store");
            return Ok(self.store.get(&key).await?);
        }

        let parsed = Url::parse(url)
            .map_err(|e| PipelineError::validation(format!("Invalid legacy url {url}: {e}")))?;
        debug!(url = %parsed, "Downloading legacy object");
        let response = self.http.get(parsed).send().await?.error_for_status()?;
        Ok(response.bytes().await?.to_vec())
    }
}
