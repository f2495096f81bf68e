//! PMP Worker - runs the derivative and document queues

use anyhow::Result;
use pmp_common::logging::{init_logging, LogConfig};
use pmp_pipeline::{config::Config, context::PipelineContext};
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    // Environment variables take precedence over the defaults
    let log_config = LogConfig::from_env()
        .unwrap_or_default()
        .with_prefix("pmp-worker");
    init_logging(&log_config)?;

    info!("Starting PMP worker");

    let config = Config::load()?;
    info!(
        derivative_workers = config.worker.derivative_concurrency,
        document_workers = config.worker.document_concurrency,
        "Configuration loaded"
    );

    let context = PipelineContext::connect(config).await?;
    let pool = Arc::new(context.worker_pool()?);

    let cancel = CancellationToken::new();
    pool.start(cancel.clone());

    shutdown_signal().await;
    cancel.cancel();
    pool.shutdown().await;
    context.close().await;

    info!("Worker shut down gracefully");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, finishing running jobs");
        },
        _ = terminate => {
            info!("Received terminate signal, finishing running jobs");
        },
    }
}
