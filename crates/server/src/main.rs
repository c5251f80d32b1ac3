use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::sync::watch;
use tracing::{info, warn};

use greenops_core::config::{self, QueueBackend, StoreBackend};
use greenops_core::Config;
use greenops_queue::{MemoryQueue, QueueConsumer, QueueProducer, SqsQueue};
use greenops_server::{build_router, background, AppState, Submitter};
use greenops_worker::{ItemProcessor, WorkerPool};

/// greenops HTTP server.
#[derive(Parser, Debug)]
#[command(name = "greenops-server", version, about)]
struct Cli {
    /// Override PORT.
    #[arg(long)]
    port: Option<u16>,

    /// Force the in-process worker pool on or off (EMBEDDED_WORKERS).
    #[arg(long)]
    embedded_workers: Option<bool>,
}

/// One queue handle seen from both sides.
struct Queue {
    producer: Arc<dyn QueueProducer>,
    consumer: Arc<dyn QueueConsumer>,
}

async fn connect_queue(config: &Config) -> anyhow::Result<Queue> {
    Ok(match config.queue.backend {
        QueueBackend::Memory => {
            let queue = Arc::new(MemoryQueue::new(
                config.queue.visibility_timeout(),
                config.queue.poll_interval(),
            ));
            Queue {
                producer: queue.clone(),
                consumer: queue,
            }
        }
        QueueBackend::Sqs => {
            let queue = Arc::new(
                SqsQueue::new(&config.aws, &config.queue)
                    .await
                    .context("failed to connect SQS queue")?,
            );
            Queue {
                producer: queue.clone(),
                consumer: queue,
            }
        }
    })
}

async fn serve(config: Config) -> anyhow::Result<()> {
    config.log_summary();

    let store = greenops_store::connect(&config.aws, &config.store)
        .await
        .context("failed to connect job store")?;
    let queue = connect_queue(&config).await?;

    if config.store.backend == StoreBackend::Memory {
        let every = std::time::Duration::from_secs(config.store.sweep_interval_secs.max(1));
        background::spawn_ttl_sweeper(store.clone(), every);
    }

    let (stop_tx, stop_rx) = watch::channel(false);

    let pool_handle = if config.worker.embedded {
        let processor = ItemProcessor::from_config(store.clone(), &config.worker)
            .context("failed to build analyzers")?;
        let pool = WorkerPool::from_config(
            queue.consumer.clone(),
            Arc::new(processor),
            &config.queue,
            &config.worker,
        );
        let mut stop = stop_rx.clone();
        Some(tokio::spawn(async move {
            let shutdown = async move {
                let _ = stop.changed().await;
            };
            if let Err(e) = pool.run(shutdown).await {
                warn!(error = %e, "Embedded worker pool failed");
            }
        }))
    } else {
        if config.queue.backend == QueueBackend::Memory {
            warn!("Memory queue without embedded workers: submitted items will never be processed");
        }
        None
    };

    let state = Arc::new(AppState::new(
        store.clone(),
        Submitter::new(store, queue.producer),
        queue.consumer,
    ));
    let app = build_router(state, &config.server.cors_origin);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("Server listening on http://localhost:{}", config.server.port);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let _ = stop_tx.send(true);
    if let Some(handle) = pool_handle {
        info!("Waiting for embedded workers to drain");
        let _ = handle.await;
    }
    info!("Server stopped");
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

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    config::load_dotenv();

    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = Config::from_env();
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(embedded) = cli.embedded_workers {
        config.worker.embedded = embedded;
    }

    serve(config).await
}
