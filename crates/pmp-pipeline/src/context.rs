//! Explicit connect/close lifecycle for the pipeline's clients
//!
//! Every stage receives its store, repositories and queue from a
//! [`PipelineContext`]; nothing is held in globals.

use anyhow::Context as _;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::config::Config;
use crate::db::{LegacyRepository, MemoryRepository, PgRepository, PhotoRepository, ProcessingLog};
use crate::error::PipelineResult;
use crate::ingest::IngestionGateway;
use crate::manifest::ManifestBuilder;
use crate::migration::{LegacyFetcher, MigrationOrchestrator};
use crate::queue::{JobQueue, MemoryJobQueue, PgJobQueue};
use crate::storage::{MemoryStore, ObjectStore, S3Store};
use crate::worker::{DerivativeSettings, DerivativeWorker, JobProcessor, PoolConfig, WorkerPool};

/// The backends a context is assembled from
pub struct Backends {
    pub store: Arc<dyn ObjectStore>,
    pub photos: Arc<dyn PhotoRepository>,
    pub log: Arc<dyn ProcessingLog>,
    pub legacy: Arc<dyn LegacyRepository>,
    pub queue: Arc<dyn JobQueue>,
}

impl Backends {
    /// Everything in process: a [`MemoryStore`], one [`MemoryRepository`]
    /// and a [`MemoryJobQueue`] with the configured backoff
    pub fn in_memory(config: &Config) -> Self {
        let repository = Arc::new(MemoryRepository::new());
        Self {
            store: Arc::new(MemoryStore::new(config.storage.url_base())),
            photos: repository.clone(),
            log: repository.clone(),
            legacy: repository,
            queue: Arc::new(MemoryJobQueue::new(
                config.queue.backoff(),
                config.queue.attempt_limits(),
            )),
        }
    }
}

pub struct PipelineContext {
    config: Config,
    pool: Option<PgPool>,
    backends: Backends,
    settings: DerivativeSettings,
}

impl PipelineContext {
    /// Open the database pool, apply migrations and build the S3 client
    pub async fn connect(config: Config) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.database.max_connections)
            .min_connections(config.database.min_connections)
            .acquire_timeout(Duration::from_secs(config.database.connect_timeout_secs))
            .idle_timeout(Duration::from_secs(config.database.idle_timeout_secs))
            .connect(&config.database.url)
            .await
            .context("Failed to connect to database")?;
        info!("Database connection pool established");

        sqlx::migrate!("../../migrations")
            .run(&pool)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to run migrations: {}", e))?;
        info!("Database migrations completed");

        let store = S3Store::new(&config.storage);
        info!(bucket = %config.storage.bucket, "Storage client initialized");

        let repository = Arc::new(PgRepository::new(pool.clone()));
        let queue = PgJobQueue::new(
            pool.clone(),
            config.queue.backoff(),
            config.queue.attempt_limits(),
        );

        let backends = Backends {
            store: Arc::new(store),
            photos: repository.clone(),
            log: repository.clone(),
            legacy: repository,
            queue: Arc::new(queue),
        };

        Ok(Self {
            config,
            pool: Some(pool),
            backends,
            settings: DerivativeSettings::default(),
        })
    }

    /// Assemble a context over caller-supplied backends
    pub fn from_backends(config: Config, backends: Backends) -> Self {
        Self {
            config,
            pool: None,
            backends,
            settings: DerivativeSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: DerivativeSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn backends(&self) -> &Backends {
        &self.backends
    }

    pub fn ingestion_gateway(&self) -> IngestionGateway {
        IngestionGateway::new(
            self.backends.store.clone(),
            self.backends.photos.clone(),
            self.backends.queue.clone(),
            self.config.ingest.clone(),
        )
    }

    pub fn manifest_builder(&self) -> ManifestBuilder {
        ManifestBuilder::new(
            self.backends.store.clone(),
            self.backends.photos.clone(),
            self.backends.log.clone(),
        )
    }

    pub fn migration_orchestrator(&self) -> PipelineResult<MigrationOrchestrator> {
        let fetcher = LegacyFetcher::new(
            self.backends.store.clone(),
            self.config.migration.legacy_bucket_marker.clone(),
            Duration::from_secs(self.config.migration.http_timeout_secs),
        )?;
        Ok(MigrationOrchestrator::new(
            self.backends.legacy.clone(),
            self.backends.photos.clone(),
            self.backends.log.clone(),
            self.backends.store.clone(),
            fetcher,
            self.settings,
        ))
    }

    pub fn job_processor(&self) -> PipelineResult<JobProcessor> {
        let derivatives = DerivativeWorker::new(
            self.backends.store.clone(),
            self.backends.photos.clone(),
            self.backends.queue.clone(),
            self.settings,
        );
        Ok(JobProcessor::new(
            derivatives,
            Arc::new(self.manifest_builder()),
            Arc::new(self.migration_orchestrator()?),
        ))
    }

    pub fn worker_pool(&self) -> PipelineResult<WorkerPool> {
        Ok(WorkerPool::new(
            self.backends.queue.clone(),
            Arc::new(self.job_processor()?),
            PoolConfig::from_config(&self.config.queue, &self.config.worker),
        ))
    }

    /// Close the database pool; call after every worker has stopped
    pub async fn close(self) {
        if let Some(pool) = self.pool {
            pool.close().await;
            info!("Database connection pool closed");
        }
    }
}
