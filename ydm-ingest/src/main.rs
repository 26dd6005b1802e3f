//! ydm-ingest - YOLO dataset import service
//!
//! Accepts import requests over HTTP, runs them on a pool of queue workers
//! and serves the resulting dataset metadata.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;
use ydm_common::config::{self, ConfigOverrides};

use ydm_ingest::gateways::{queue_from_settings, storage_from_settings, SqliteMetadataStore};
use ydm_ingest::services::{BlobFetcher, FetchPolicy, ImportOrchestrator, ImportService};
use ydm_ingest::worker::WorkerPool;
use ydm_ingest::AppState;

#[derive(Debug, Parser)]
#[command(name = "ydm-ingest", version, about = "YOLO dataset import service")]
struct Cli {
    /// TOML config file
    #[arg(long, env = "YDM_CONFIG")]
    config: Option<PathBuf>,

    /// Address to listen on, e.g. 0.0.0.0:5740
    #[arg(long)]
    bind_address: Option<String>,

    #[arg(long)]
    data_dir: Option<PathBuf>,

    #[arg(long)]
    database_path: Option<PathBuf>,

    /// Concurrent import workers
    #[arg(long)]
    workers: Option<usize>,

    #[arg(long)]
    log_level: Option<String>,
}

impl From<Cli> for ConfigOverrides {
    fn from(cli: Cli) -> Self {
        ConfigOverrides {
            config_file: cli.config,
            bind_address: cli.bind_address,
            data_dir: cli.data_dir,
            database_path: cli.database_path,
            workers: cli.workers,
            log_level: cli.log_level,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = config::load(&cli.into()).context("Failed to load configuration")?;

    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&settings.logging.level))
        .context("Invalid log level")?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting ydm-ingest");
    info!("Version: {} ({})", env!("CARGO_PKG_VERSION"), env!("YDM_GIT_HASH"));

    let db_path = settings.database_path();
    info!("Database: {}", db_path.display());
    let pool = ydm_common::db::init_database(&db_path)
        .await
        .context("Failed to open database")?;

    let metadata = Arc::new(SqliteMetadataStore::new(pool.clone()));
    let storage = storage_from_settings(&settings);
    let queue = queue_from_settings(&settings, &pool);
    info!(
        storage = ?settings.storage.backend,
        queue = ?settings.queue.backend,
        workers = settings.workers,
        "Backends selected"
    );

    let fetcher = BlobFetcher::new(FetchPolicy::from_settings(&settings.import))?;
    let orchestrator = Arc::new(ImportOrchestrator::new(
        metadata.clone(),
        storage,
        fetcher,
        settings.import.clone(),
    ));

    let shutdown = CancellationToken::new();
    let pool_handle = WorkerPool::new(
        queue.clone(),
        orchestrator,
        Duration::from_millis(settings.queue.poll_interval_ms),
    );
    let workers = pool_handle.spawn(settings.workers, shutdown.clone());

    let state = AppState::new(ImportService::new(metadata, queue));
    let app = ydm_ingest::build_router(state);

    let listener = tokio::net::TcpListener::bind(&settings.bind_address)
        .await
        .with_context(|| format!("Failed to bind {}", settings.bind_address))?;
    info!("Listening on http://{}", settings.bind_address);

    let server_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutdown requested");
            }
            server_shutdown.cancel();
        })
        .await?;

    // Workers finish the delivery in hand; unfinished jobs are redelivered
    // after their lease expires.
    for worker in workers {
        let _ = worker.await;
    }
    info!("ydm-ingest stopped");
    Ok(())
}
