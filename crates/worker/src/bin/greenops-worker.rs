//! Standalone worker pool consuming the SQS work queue.

use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;
use tracing::{info, warn};

use greenops_core::config::{self, QueueBackend, StoreBackend};
use greenops_core::Config;
use greenops_queue::SqsQueue;
use greenops_worker::{ItemProcessor, WorkerPool};

/// Consume work items, run analyzers, record progress.
#[derive(Parser, Debug)]
#[command(name = "greenops-worker", version, about)]
struct Cli {
    /// Override WORKER_CONCURRENCY.
    #[arg(long)]
    concurrency: Option<usize>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    config::load_dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = Config::from_env();
    if let Some(n) = cli.concurrency {
        config.worker.concurrency = n.max(1);
    }
    config.log_summary();

    // A separate process cannot share in-memory state with the server.
    if config.queue.backend != QueueBackend::Sqs {
        bail!(
            "greenops-worker needs QUEUE_BACKEND=sqs; \
             use EMBEDDED_WORKERS with the server for local runs"
        );
    }
    if config.store.backend != StoreBackend::DynamoDb {
        bail!("greenops-worker needs STORE_BACKEND=dynamodb");
    }

    let store = greenops_store::connect(&config.aws, &config.store)
        .await
        .context("failed to connect job store")?;
    let queue = Arc::new(
        SqsQueue::new(&config.aws, &config.queue)
            .await
            .context("failed to connect work queue")?,
    );

    let processor = Arc::new(
        ItemProcessor::from_config(store, &config.worker).context("failed to build analyzers")?,
    );
    let pool = WorkerPool::from_config(queue, processor, &config.queue, &config.worker);

    info!("greenops-worker starting");
    pool.run(shutdown_signal()).await?;
    info!("greenops-worker exited cleanly");
    Ok(())
}

/// Resolve on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to register SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("Shutdown signal received");
}
