use serde::{Deserialize, Serialize};
use std::env;

pub const DEFAULT_S3_REGION: &str = "us-east-1";
pub const DEFAULT_S3_BUCKET: &str = "protocol-media";
pub const DEFAULT_S3_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub endpoint: Option<String>,
    pub region: String,
    pub bucket: String,
    pub access_key: String,
    #[serde(skip_serializing)]
    pub secret_key: String,
    pub path_style: bool,
    /// Base for public object urls, e.g. a CDN or R2 public domain.
    /// When unset urls are built from the endpoint and bucket.
    pub public_base_url: Option<String>,
    pub timeout_secs: u64,
}

impl StorageConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let timeout_secs = match env::var("S3_TIMEOUT_SECS") {
            Ok(v) => v
                .parse()
                .map_err(|e| anyhow::anyhow!("Invalid S3_TIMEOUT_SECS '{}': {}", v, e))?,
            Err(_) => DEFAULT_S3_TIMEOUT_SECS,
        };

        Ok(Self {
            endpoint: env::var("S3_ENDPOINT").ok(),
            region: env::var("S3_REGION").unwrap_or_else(|_| DEFAULT_S3_REGION.to_string()),
            bucket: env::var("S3_BUCKET").unwrap_or_else(|_| DEFAULT_S3_BUCKET.to_string()),
            access_key: env::var("S3_ACCESS_KEY")
                .or_else(|_| env::var("AWS_ACCESS_KEY_ID"))
                .unwrap_or_else(|_| "minioadmin".to_string()),
            secret_key: env::var("S3_SECRET_KEY")
                .or_else(|_| env::var("AWS_SECRET_ACCESS_KEY"))
                .unwrap_or_else(|_| "minioadmin".to_string()),
            path_style: env::var("S3_PATH_STYLE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(false),
            public_base_url: env::var("S3_PUBLIC_BASE_URL").ok(),
            timeout_secs,
        })
    }

    pub fn for_minio(endpoint: impl Into<String>, bucket: impl Into<String>) -> Self {
        Self {
            endpoint: Some(endpoint.into()),
            region: DEFAULT_S3_REGION.to_string(),
            bucket: bucket.into(),
            access_key: "minioadmin".to_string(),
            secret_key: "minioadmin".to_string(),
            path_style: true,
            public_base_url: None,
            timeout_secs: DEFAULT_S3_TIMEOUT_SECS,
        }
    }

    /// Url prefix that object keys are appended to
    pub fn url_base(&self) -> String {
        match (&self.public_base_url, &self.endpoint) {
            (Some(base), _) => base.trim_end_matches('/').to_string(),
            (None, Some(endpoint)) => {
                format!("{}/{}", endpoint.trim_end_matches('/'), self.bucket)
            },
            (None, None) => format!("https://{}.s3.{}.amazonaws.com", self.bucket, self.region),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.bucket.is_empty() {
            anyhow::bail!("S3 bucket cannot be empty");
        }
        if self.timeout_secs == 0 {
            anyhow::bail!("S3 timeout must be greater than 0");
        }
        if let Some(base) = &self.public_base_url {
            url::Url::parse(base)
                .map_err(|e| anyhow::anyhow!("Invalid S3_PUBLIC_BASE_URL '{}': {}", base, e))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_for_minio() {
        let config = StorageConfig::for_minio("http://localhost:9000", "test-bucket");
        assert_eq!(config.endpoint, Some("http://localhost:9000".to_string()));
        assert!(config.path_style);
        assert_eq!(config.url_base(), "http://localhost:9000/test-bucket");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_public_base_url_wins() {
        let mut config = StorageConfig::for_minio("http://localhost:9000/", "media");
        config.public_base_url = Some("https://cdn.example.com/".to_string());
        assert_eq!(config.url_base(), "https://cdn.example.com");

        config.public_base_url = Some("not a url".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_aws_default_url() {
        let mut config = StorageConfig::for_minio("unused", "media");
        config.endpoint = None;
        config.region = "eu-central-1".to_string();
        assert_eq!(config.url_base(), "https://media.s3.eu-central-1.amazonaws.com");
    }
}
