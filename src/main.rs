//! Conclave - multi-model deliberation backend
//!
//! # Usage
//!
//! ```bash
//! # Run with the default config search path
//! cargo run --release
//!
//! # Explicit config and bind address
//! cargo run --release -- --config deploy/conclave.toml --addr 0.0.0.0:9000
//! ```
//!
//! # Environment Variables
//!
//! - `OPENROUTER_API_KEY`: provider API key (required; also read from .env)
//! - `CONCLAVE_CONFIG`: path to the TOML config file
//! - `CONCLAVE_CORS_ORIGINS`: comma-separated CORS allowlist for development
//! - `RUST_LOG`: logging filter (default: info)

use anyhow::{Context, Result};
use clap::Parser;
use dashmap::DashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use conclave::api::{create_app, ApiContext};
use conclave::config::{AppConfig, SharedConfig};
use conclave::council::CouncilOrchestrator;
use conclave::gateway::OpenRouterGateway;
use conclave::jobs::worker::{run_worker, WorkerContext};
use conclave::jobs::JobStore;
use conclave::store::ConversationStore;

// ============================================================================
// CLI Arguments
// ============================================================================

#[derive(Parser, Debug)]
#[command(name = "conclave")]
#[command(about = "Conclave multi-model deliberation backend")]
#[command(version)]
struct CliArgs {
    /// Path to the TOML config file (overrides CONCLAVE_CONFIG)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the server bind address (default from config)
    #[arg(short, long)]
    addr: Option<String>,

    /// Override the data directory (default from config)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Override the number of job workers (default from config)
    #[arg(long)]
    workers: Option<usize>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // .env is optional; real deployments set the environment directly.
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = CliArgs::parse();

    let (mut config, config_path) = match &args.config {
        Some(path) => {
            let loaded = AppConfig::load_from_file(path)
                .with_context(|| format!("Failed to load config from {}", path.display()))?;
            (loaded, Some(path.clone()))
        }
        None => (AppConfig::load(), default_config_path()),
    };
    if let Some(addr) = args.addr {
        config.server.addr = addr;
    }
    if let Some(data_dir) = args.data_dir {
        config.storage.data_dir = data_dir;
    }
    if let Some(workers) = args.workers {
        config.server.workers = workers;
    }
    config.validate().context("Invalid configuration")?;

    let api_key = std::env::var("OPENROUTER_API_KEY")
        .context("OPENROUTER_API_KEY is not set (put it in the environment or a .env file)")?;

    info!(
        council_size = config.council.models.len(),
        chairman = %config.council.chairman,
        workers = config.server.workers,
        "Starting conclave"
    );

    let server_addr = config.server.addr.clone();
    let worker_count = config.server.workers;
    let data_dir = config.storage.data_dir.clone();

    let db = sled::open(&data_dir)
        .with_context(|| format!("Failed to open database at {}", data_dir.display()))?;
    let store = ConversationStore::open(&db).context("Failed to open conversation store")?;
    let jobs = JobStore::open(&db).context("Failed to open job store")?;

    // Jobs orphaned by a previous crash are reprocessed from scratch.
    match jobs.recover_stale() {
        Ok(0) => {}
        Ok(n) => info!(recovered = n, "Re-enqueued jobs from interrupted run"),
        Err(e) => warn!(error = %e, "Stale job recovery failed"),
    }

    let shared_config = SharedConfig::new(config);
    let gateway = Arc::new(
        OpenRouterGateway::new(api_key, shared_config.clone())
            .context("Failed to build model gateway")?,
    );
    let orchestrator = Arc::new(CouncilOrchestrator::new(
        gateway.clone(),
        store.clone(),
        jobs.clone(),
        shared_config.clone(),
    ));

    let shutdown = CancellationToken::new();
    let mut task_set: JoinSet<Result<&'static str>> = JoinSet::new();

    // Job workers
    let worker_ctx = WorkerContext {
        jobs: jobs.clone(),
        store: store.clone(),
        orchestrator,
        in_flight: Arc::new(DashMap::new()),
    };
    for worker_id in 0..worker_count {
        let ctx = worker_ctx.clone();
        let token = shutdown.clone();
        task_set.spawn(async move {
            run_worker(worker_id, ctx, token).await;
            Ok("JobWorker")
        });
    }

    // HTTP server
    let api_ctx = ApiContext {
        store,
        jobs,
        config: shared_config,
        gateway,
        config_path,
    };
    let app = create_app(api_ctx);
    let listener = tokio::net::TcpListener::bind(&server_addr)
        .await
        .with_context(|| format!("Failed to bind to {server_addr}"))?;
    info!("HTTP server listening on {server_addr}");

    let server_token = shutdown.clone();
    task_set.spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                server_token.cancelled().await;
                info!("[HttpServer] Received shutdown signal");
            })
            .await
            .context("HTTP server error")?;
        Ok("HttpServer")
    });

    // Shutdown on ctrl-c
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown requested (ctrl-c)");
            signal_token.cancel();
        }
    });

    // Supervise: the first task failure takes the process down.
    while let Some(joined) = task_set.join_next().await {
        match joined {
            Ok(Ok(name)) => info!(task = name, "Task finished"),
            Ok(Err(e)) => {
                error!(error = %e, "Task failed, shutting down");
                shutdown.cancel();
            }
            Err(e) => {
                error!(error = %e, "Task panicked, shutting down");
                shutdown.cancel();
            }
        }
    }

    info!("Shutdown complete");
    Ok(())
}

/// Default persistence target for config updates when no explicit --config
/// was given: the conventional cwd file.
fn default_config_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("CONCLAVE_CONFIG") {
        return Some(PathBuf::from(path));
    }
    Some(PathBuf::from("conclave.toml"))
}
