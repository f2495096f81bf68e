//! Protocol Media Pipeline
//!
//! Asynchronous processing of the photos attached to rental handover and
//! return protocols.
//!
//! # Overview
//!
//! - **Ingestion** ([`ingest`]): stores an uploaded original and queues its
//!   derivative job
//! - **Job queue** ([`queue`]): durable, retrying work distribution with
//!   stall recovery
//! - **Derivative worker** ([`worker`]): validates an image and produces the
//!   thumbnail, gallery and document renditions
//! - **Manifests** ([`manifest`]): hash-addressed, versioned listings of a
//!   protocol's photos with integrity verification
//! - **Migration** ([`migration`]): batch replay of legacy protocols through
//!   the same pipeline
//!
//! Storage ([`storage`]), persistence ([`db`]) and the queue are traits with
//! Postgres/S3 and in-memory implementations. [`context::PipelineContext`]
//! wires them together.
//!
//! # Example
//!
//! ```no_run
//! use pmp_pipeline::{config::Config, context::PipelineContext};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let context = PipelineContext::connect(Config::load()?).await?;
//!     let drained = context.worker_pool()?.drain().await?;
//!     tracing::info!(drained, "Queues drained");
//!     context.close().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod context;
pub mod db;
pub mod error;
pub mod ingest;
pub mod manifest;
pub mod migration;
pub mod models;
pub mod queue;
pub mod storage;
pub mod worker;

pub use error::{PipelineError, PipelineResult};
