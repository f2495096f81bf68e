//! Pipeline error types
//!
//! Every stage reports failures as [`PipelineError`]. The queue asks
//! [`PipelineError::is_retryable`] to decide between a backoff retry and a
//! permanent failure.

use thiserror::Error;
use uuid::Uuid;

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;

/// How a storage failure should be treated by the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageErrorKind {
    /// Timeouts, dropped connections, 5xx and throttling
    Transient,
    /// Credentials, permissions, malformed requests
    Permanent,
    NotFound,
}

#[derive(Error, Debug, Clone)]
#[error("{kind:?} storage error: {message}")]
pub struct StorageError {
    pub kind: StorageErrorKind,
    pub message: String,
}

impl StorageError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: StorageErrorKind::Transient,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: StorageErrorKind::Permanent,
            message: message.into(),
        }
    }

    pub fn not_found(key: &str) -> Self {
        Self {
            kind: StorageErrorKind::NotFound,
            message: format!("object not found: {key}"),
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind == StorageErrorKind::NotFound
    }
}

#[derive(Error, Debug)]
pub enum PipelineError {
    /// Malformed, undersized, oversized or unsupported upload
    #[error("Validation error: {0}")]
    Validation(String),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("Integrity error for {context}: expected {expected}, got {actual}")]
    Integrity {
        expected: String,
        actual: String,
        context: String,
    },

    #[error("Queue error: {0}")]
    Queue(String),

    #[error("Migration of protocol {protocol_id} failed: {message}")]
    Migration { protocol_id: Uuid, message: String },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// A concurrent writer claimed the same unique slot first
    #[error("Conflict: {0}")]
    Conflict(String),
}

impl PipelineError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn migration(protocol_id: Uuid, err: impl std::fmt::Display) -> Self {
        Self::Migration {
            protocol_id,
            message: err.to_string(),
        }
    }

    /// Whether the queue should schedule another attempt
    pub fn is_retryable(&self) -> bool {
        match self {
            PipelineError::Storage(e) => e.kind == StorageErrorKind::Transient,
            PipelineError::Http(e) => {
                e.is_timeout()
                    || e.is_connect()
                    || e.status().is_some_and(|s| s.is_server_error())
            },
            PipelineError::Database(e) => !matches!(e, sqlx::Error::RowNotFound),
            PipelineError::Queue(_) | PipelineError::Conflict(_) => true,
            PipelineError::Validation(_)
            | PipelineError::Integrity { .. }
            | PipelineError::Migration { .. }
            | PipelineError::Serialization(_)
            | PipelineError::Config(_)
            | PipelineError::NotFound(_) => false,
        }
    }
}

impl From<pmp_common::CommonError> for PipelineError {
    fn from(err: pmp_common::CommonError) -> Self {
        match err {
            pmp_common::CommonError::ChecksumMismatch { expected, actual } => {
                PipelineError::Integrity {
                    expected,
                    actual,
                    context: "checksum".to_string(),
                }
            },
            pmp_common::CommonError::Serialization(e) => PipelineError::Serialization(e),
            other @ pmp_common::CommonError::UnknownVariant { .. } => {
                PipelineError::Validation(other.to_string())
            },
        }
    }
}
