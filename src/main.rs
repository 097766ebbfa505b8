//! LLMSee - main entry point
//!
//! Loads configuration, opens the audit database and serves the proxy until
//! interrupted.

use anyhow::{Context, Result};
use clap::Parser;
use llmsee_proxy::{
    api::{build_router, AppState},
    core::{
        config::{find_config_file, AppConfig},
        init_metrics,
        logging::init_tracing,
        SqliteAuditLog,
    },
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Parser)]
#[command(name = "llmsee", version, about = "Transparent auditing proxy for LLM APIs")]
struct Cli {
    /// Path to the JSON configuration file
    #[arg(short = 'c', long = "config", env = "LLMSEE_CONFIGFILE")]
    config: Option<PathBuf>,
}

fn main() -> Result<()> {
    // Load .env file if present (before reading any environment variables)
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    if let Some(threads) = std::env::var("TOKIO_WORKER_THREADS")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
    {
        builder.worker_threads(threads);
    }
    let runtime = builder.enable_all().build()?;

    runtime.block_on(async_main(cli))
}

async fn async_main(cli: Cli) -> Result<()> {
    init_tracing();
    init_metrics();

    let config_path = find_config_file(cli.config);
    let config = AppConfig::load(config_path.as_deref())?;

    let db_path = config.database_path()?;
    let store = SqliteAuditLog::connect(&db_path)
        .await
        .with_context(|| format!("failed to open database {}", db_path.display()))?;

    let state = Arc::new(AppState::new(config, Arc::new(store))?);
    state.registry.log_backends();

    let addr = state.config.listen_addr();
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;

    tracing::info!("LLMSee {} listening on http://{}", env!("CARGO_PKG_VERSION"), addr);
    tracing::info!("Unified API: http://{}/v1", addr);
    tracing::info!("Audit log: /log, live updates: /ui/sse, metrics: /metrics");

    let cancel = CancellationToken::new();
    let app = build_router(state.clone());
    let shutdown = cancel.clone();
    let mut server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await
    });

    tokio::select! {
        result = &mut server => {
            result.context("server task failed")??;
            return Ok(());
        }
        _ = shutdown_signal() => {}
    }

    tracing::info!("Shutting down");
    state.hub.shutdown();
    cancel.cancel();

    let grace = Duration::from_secs(state.config.shutdown_timeout_secs);
    match tokio::time::timeout(grace, server).await {
        Ok(result) => {
            result.context("server task failed")??;
            tracing::info!("Server stopped");
        }
        Err(_) => {
            tracing::warn!(
                "In-flight requests still running after {}s, exiting",
                grace.as_secs()
            );
        }
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
