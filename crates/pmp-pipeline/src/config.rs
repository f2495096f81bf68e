//! Configuration management

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

use crate::queue::{AttemptLimits, BackoffPolicy};
use crate::storage::config::StorageConfig;

// ============================================================================
// Database
// ============================================================================

pub const DEFAULT_DATABASE_URL: &str = "postgresql://localhost/protocol_media";
pub const DEFAULT_DATABASE_MAX_CONNECTIONS: u32 = 10;
pub const DEFAULT_DATABASE_MIN_CONNECTIONS: u32 = 2;
pub const DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS: u64 = 10;
/// 10 minutes
pub const DEFAULT_DATABASE_IDLE_TIMEOUT_SECS: u64 = 600;

// ============================================================================
// Queue
// ============================================================================

pub const DEFAULT_QUEUE_POLL_INTERVAL_MS: u64 = 500;
pub const DEFAULT_QUEUE_STALL_TIMEOUT_SECS: u64 = 120;
pub const DEFAULT_QUEUE_HEARTBEAT_INTERVAL_SECS: u64 = 15;
pub const DEFAULT_QUEUE_WATCHDOG_INTERVAL_SECS: u64 = 30;
pub const DEFAULT_QUEUE_BACKOFF_BASE_MS: u64 = 2_000;
pub const DEFAULT_QUEUE_BACKOFF_MAX_MS: u64 = 300_000;
pub const DEFAULT_QUEUE_DERIVATIVE_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_QUEUE_DOCUMENT_MAX_ATTEMPTS: u32 = 2;

// ============================================================================
// Workers, ingestion, migration
// ============================================================================

pub const DEFAULT_WORKER_DERIVATIVE_CONCURRENCY: usize = 4;
pub const DEFAULT_WORKER_DOCUMENT_CONCURRENCY: usize = 1;
/// 50 MiB
pub const DEFAULT_INGEST_MAX_UPLOAD_BYTES: usize = 50 * 1024 * 1024;
pub const DEFAULT_INGEST_UPLOAD_CONCURRENCY: usize = 5;
pub const DEFAULT_MIGRATION_BATCH_SIZE: usize = 10;
/// Legacy urls containing this marker live in the object store itself
pub const DEFAULT_MIGRATION_LEGACY_BUCKET_MARKER: &str = "blackrent-storage";
pub const DEFAULT_MIGRATION_HTTP_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    pub storage: StorageConfig,
    pub queue: QueueConfig,
    pub worker: WorkerConfig,
    pub ingest: IngestConfig,
    pub migration: MigrationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout_secs: u64,
    pub idle_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    pub poll_interval_ms: u64,
    /// Active jobs without a heartbeat for this long are considered stalled
    pub stall_timeout_secs: u64,
    pub heartbeat_interval_secs: u64,
    pub watchdog_interval_secs: u64,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub derivative_max_attempts: u32,
    pub document_max_attempts: u32,
}

impl QueueConfig {
    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy::new(
            Duration::from_millis(self.backoff_base_ms),
            Duration::from_millis(self.backoff_max_ms),
        )
    }

    pub fn attempt_limits(&self) -> AttemptLimits {
        AttemptLimits {
            derivative: self.derivative_max_attempts,
            document: self.document_max_attempts,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn stall_timeout(&self) -> Duration {
        Duration::from_secs(self.stall_timeout_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_secs(self.watchdog_interval_secs)
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: DEFAULT_QUEUE_POLL_INTERVAL_MS,
            stall_timeout_secs: DEFAULT_QUEUE_STALL_TIMEOUT_SECS,
            heartbeat_interval_secs: DEFAULT_QUEUE_HEARTBEAT_INTERVAL_SECS,
            watchdog_interval_secs: DEFAULT_QUEUE_WATCHDOG_INTERVAL_SECS,
            backoff_base_ms: DEFAULT_QUEUE_BACKOFF_BASE_MS,
            backoff_max_ms: DEFAULT_QUEUE_BACKOFF_MAX_MS,
            derivative_max_attempts: DEFAULT_QUEUE_DERIVATIVE_MAX_ATTEMPTS,
            document_max_attempts: DEFAULT_QUEUE_DOCUMENT_MAX_ATTEMPTS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub derivative_concurrency: usize,
    pub document_concurrency: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            derivative_concurrency: DEFAULT_WORKER_DERIVATIVE_CONCURRENCY,
            document_concurrency: DEFAULT_WORKER_DOCUMENT_CONCURRENCY,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    pub max_upload_bytes: usize,
    pub upload_concurrency: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            max_upload_bytes: DEFAULT_INGEST_MAX_UPLOAD_BYTES,
            upload_concurrency: DEFAULT_INGEST_UPLOAD_CONCURRENCY,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationConfig {
    pub batch_size: usize,
    pub legacy_bucket_marker: String,
    pub http_timeout_secs: u64,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_MIGRATION_BATCH_SIZE,
            legacy_bucket_marker: DEFAULT_MIGRATION_LEGACY_BUCKET_MARKER.to_string(),
            http_timeout_secs: DEFAULT_MIGRATION_HTTP_TIMEOUT_SECS,
        }
    }
}

/// Parse an env var, falling back to `default` when unset or unparsable
fn env_or<T: FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

impl Config {
    /// Load configuration from environment and defaults
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let config = Config {
            database: DatabaseConfig {
                url: std::env::var("DATABASE_URL")
                    .unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string()),
                max_connections: env_or("DATABASE_MAX_CONNECTIONS", DEFAULT_DATABASE_MAX_CONNECTIONS),
                min_connections: env_or("DATABASE_MIN_CONNECTIONS", DEFAULT_DATABASE_MIN_CONNECTIONS),
                connect_timeout_secs: env_or(
                    "DATABASE_CONNECT_TIMEOUT",
                    DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS,
                ),
                idle_timeout_secs: env_or("DATABASE_IDLE_TIMEOUT", DEFAULT_DATABASE_IDLE_TIMEOUT_SECS),
            },
            storage: StorageConfig::from_env()?,
            queue: QueueConfig {
                poll_interval_ms: env_or("QUEUE_POLL_INTERVAL_MS", DEFAULT_QUEUE_POLL_INTERVAL_MS),
                stall_timeout_secs: env_or("QUEUE_STALL_TIMEOUT_SECS", DEFAULT_QUEUE_STALL_TIMEOUT_SECS),
                heartbeat_interval_secs: env_or(
                    "QUEUE_HEARTBEAT_INTERVAL_SECS",
                    DEFAULT_QUEUE_HEARTBEAT_INTERVAL_SECS,
                ),
                watchdog_interval_secs: env_or(
                    "QUEUE_WATCHDOG_INTERVAL_SECS",
                    DEFAULT_QUEUE_WATCHDOG_INTERVAL_SECS,
                ),
                backoff_base_ms: env_or("QUEUE_BACKOFF_BASE_MS", DEFAULT_QUEUE_BACKOFF_BASE_MS),
                backoff_max_ms: env_or("QUEUE_BACKOFF_MAX_MS", DEFAULT_QUEUE_BACKOFF_MAX_MS),
                derivative_max_attempts: env_or(
                    "QUEUE_DERIVATIVE_MAX_ATTEMPTS",
                    DEFAULT_QUEUE_DERIVATIVE_MAX_ATTEMPTS,
                ),
                document_max_attempts: env_or(
                    "QUEUE_DOCUMENT_MAX_ATTEMPTS",
                    DEFAULT_QUEUE_DOCUMENT_MAX_ATTEMPTS,
                ),
            },
            worker: WorkerConfig {
                derivative_concurrency: env_or(
                    "WORKER_DERIVATIVE_CONCURRENCY",
                    DEFAULT_WORKER_DERIVATIVE_CONCURRENCY,
                ),
                document_concurrency: env_or(
                    "WORKER_DOCUMENT_CONCURRENCY",
                    DEFAULT_WORKER_DOCUMENT_CONCURRENCY,
                ),
            },
            ingest: IngestConfig {
                max_upload_bytes: env_or("INGEST_MAX_UPLOAD_BYTES", DEFAULT_INGEST_MAX_UPLOAD_BYTES),
                upload_concurrency: env_or(
                    "INGEST_UPLOAD_CONCURRENCY",
                    DEFAULT_INGEST_UPLOAD_CONCURRENCY,
                ),
            },
            migration: MigrationConfig {
                batch_size: env_or("MIGRATION_BATCH_SIZE", DEFAULT_MIGRATION_BATCH_SIZE),
                legacy_bucket_marker: std::env::var("MIGRATION_LEGACY_BUCKET_MARKER")
                    .unwrap_or_else(|_| DEFAULT_MIGRATION_LEGACY_BUCKET_MARKER.to_string()),
                http_timeout_secs: env_or(
                    "MIGRATION_HTTP_TIMEOUT_SECS",
                    DEFAULT_MIGRATION_HTTP_TIMEOUT_SECS,
                ),
            },
        };

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.database.url.is_empty() {
            anyhow::bail!("Database URL cannot be empty");
        }

        if self.database.max_connections == 0 {
            anyhow::bail!("Database max_connections must be greater than 0");
        }

        if self.database.min_connections > self.database.max_connections {
            anyhow::bail!(
                "Database min_connections ({}) cannot be greater than max_connections ({})",
                self.database.min_connections,
                self.database.max_connections
            );
        }

        self.storage.validate()?;

        if self.queue.derivative_max_attempts == 0 || self.queue.document_max_attempts == 0 {
            anyhow::bail!("Queue max attempts must be at least 1");
        }

        if self.queue.backoff_base_ms > self.queue.backoff_max_ms {
            anyhow::bail!(
                "Queue backoff base ({}ms) cannot exceed backoff max ({}ms)",
                self.queue.backoff_base_ms,
                self.queue.backoff_max_ms
            );
        }

        if self.queue.heartbeat_interval_secs >= self.queue.stall_timeout_secs {
            anyhow::bail!(
                "Heartbeat interval ({}s) must be shorter than the stall timeout ({}s)",
                self.queue.heartbeat_interval_secs,
                self.queue.stall_timeout_secs
            );
        }

        if self.worker.derivative_concurrency == 0 {
            anyhow::bail!("Derivative worker concurrency must be greater than 0");
        }

        if self.ingest.upload_concurrency == 0 || self.migration.batch_size == 0 {
            anyhow::bail!("Upload concurrency and migration batch size must be greater than 0");
        }

        if self.worker.document_concurrency == 0 {
            tracing::warn!("Document worker concurrency is 0 - manifests will not be generated");
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: DEFAULT_DATABASE_URL.to_string(),
                max_connections: DEFAULT_DATABASE_MAX_CONNECTIONS,
                min_connections: DEFAULT_DATABASE_MIN_CONNECTIONS,
                connect_timeout_secs: DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS,
                idle_timeout_secs: DEFAULT_DATABASE_IDLE_TIMEOUT_SECS,
            },
            storage: StorageConfig::for_minio("http://localhost:9000", "protocol-media"),
            queue: QueueConfig::default(),
            worker: WorkerConfig::default(),
            ingest: IngestConfig::default(),
            migration: MigrationConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.queue.attempt_limits(), AttemptLimits { derivative: 3, document: 2 });
        assert_eq!(config.queue.backoff().base, Duration::from_secs(2));
        assert_eq!(config.ingest.max_upload_bytes, 52_428_800);
        assert_eq!(config.migration.batch_size, 10);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.database.min_connections = 20;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.queue.heartbeat_interval_secs = config.queue.stall_timeout_secs;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.queue.derivative_max_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.migration.batch_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_env_or_falls_back_on_garbage() {
        std::env::set_var("PMP_TEST_ENV_OR", "not-a-number");
        assert_eq!(env_or("PMP_TEST_ENV_OR", 7u32), 7);
        std::env::set_var("PMP_TEST_ENV_OR", "12");
        assert_eq!(env_or("PMP_TEST_ENV_OR", 7u32), 12);
        std::env::remove_var("PMP_TEST_ENV_OR");
    }
}
