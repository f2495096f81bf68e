//! PMP Common Library
//!
//! Shared types, integrity utilities, and logging bootstrap for the protocol
//! media pipeline.
//!
//! # Overview
//!
//! This crate holds everything that is pure and reusable across the
//! pipeline workspace:
//!
//! - **Integrity**: SHA-256 / MD5 digests, verification, duplicate detection
//!   and manifest rows ([`checksum`])
//! - **Types**: photo status and derivative kinds shared by every stage
//! - **Logging**: `tracing` subscriber initialisation
//!
//! # Example
//!
//! ```
//! use pmp_common::checksum::{digest, verify};
//!
//! let d = digest(b"photo bytes");
//! assert_eq!(d.sha256.len(), 64);
//! assert!(verify(b"photo bytes", &d.sha256));
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod checksum;
pub mod error;
pub mod logging;
pub mod types;

// Re-export commonly used types
pub use error::{CommonError, Result};
pub use types::{DerivativeKind, PhotoStatus, Renditions};
