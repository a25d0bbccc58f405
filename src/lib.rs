pub mod api;
pub mod auth;
pub mod config;
pub mod db;
pub mod errors;
pub mod gateway;
pub mod ledger;
pub mod models;
pub mod redaction;

use crate::api::AppState;
use crate::auth::AuthVerifier;
use crate::config::AppConfig;
use crate::db::ScoreStore;
use crate::gateway::AdminGateway;
use anyhow::Context;
use std::path::Path;
use std::sync::Arc;
use tracing_appender::non_blocking::WorkerGuard;

static LOG_GUARD: std::sync::OnceLock<WorkerGuard> = std::sync::OnceLock::new();

pub async fn run() -> anyhow::Result<()> {
    let config = AppConfig::from_env().context("failed to read configuration")?;
    let tracing_ready = match config.log_dir.as_deref() {
        Some(log_dir) => init_file_tracing(log_dir),
        None => init_stdout_tracing(),
    };
    tracing_ready.map_err(|error| anyhow::anyhow!("failed to initialize tracing: {}", error))?;

    let verifier = AuthVerifier::new(&config.bot_token);
    if !verifier.is_configured() {
        tracing::warn!("BOT_TOKEN is empty; every signed request will be rejected");
    }
    if config.admin_ids.is_empty() {
        tracing::warn!("ADMIN_IDS is empty; admin endpoints will answer 403");
    }

    let store = ScoreStore::open(&config.store)
        .await
        .context("store is unavailable at boot")?;

    // Closed on every exit path once opened.
    let result = serve(&config, verifier, store.clone()).await;
    store.close().await;
    result
}

async fn serve(config: &AppConfig, verifier: AuthVerifier, store: ScoreStore) -> anyhow::Result<()> {
    let gateway = AdminGateway::new(store, verifier, config.admin_ids.clone());
    let app = api::router(Arc::new(AppState::new(gateway)));

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;
    tracing::info!(addr = %config.bind_addr, admins = config.admin_ids.len(), "http server ready");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("http server failed")?;
    tracing::info!("http server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %error, "ctrl-c handler unavailable");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(error) => {
                tracing::warn!(error = %error, "SIGTERM handler unavailable");
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
    tracing::info!("shutdown signal received");
}

fn env_filter() -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
}

fn init_file_tracing(log_dir: &Path) -> Result<(), String> {
    std::fs::create_dir_all(log_dir).map_err(|error| error.to_string())?;
    let file_appender = tracing_appender::rolling::daily(log_dir, "scoreboard.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let _ = LOG_GUARD.set(guard);

    tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .json()
        .with_writer(non_blocking)
        .try_init()
        .map_err(|error| error.to_string())
}

fn init_stdout_tracing() -> Result<(), String> {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .compact()
        .try_init()
        .map_err(|error| error.to_string())
}
