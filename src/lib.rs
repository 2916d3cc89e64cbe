//! taskpilot -- playbook job orchestration with live log streaming.
//!
//! This crate provides the job executor, step runner, live log tailer,
//! recurrence scheduler and the facade and HTTP binding over them.

pub mod api;
pub mod config;
pub mod error;
pub mod executor;
pub mod logs;
pub mod model;
pub mod runner;
pub mod scheduler;
pub mod service;
pub mod storage;
pub mod tail;
pub mod workspace;

pub use self::error::{Error, Result};

use std::sync::Arc;

use anyhow::Context;

use self::config::PilotConfig;
use self::service::Orchestrator;
use self::storage::SqliteRepository;

/// Open storage and build the facade for `config`.
pub fn build(config: &PilotConfig) -> anyhow::Result<Orchestrator> {
    let db_path = &config.storage.db_path;
    tracing::info!(db_path = %db_path.display(), "initializing database");
    let pool = storage::open_pool(db_path)?;
    let repo = Arc::new(SqliteRepository::new(pool));
    Ok(Orchestrator::new(repo, config.clone()))
}

/// Start the taskpilot daemon: recovery, scheduler, and API server.
pub async fn serve(config: PilotConfig) -> anyhow::Result<()> {
    let orchestrator = Arc::new(build(&config)?);

    let report = orchestrator
        .startup()
        .await
        .context("startup recovery failed")?;
    tracing::info!(scheduled = report.scheduled, rejected = report.rejected, "engine ready");

    let addr: std::net::SocketAddr = config
        .server
        .bind
        .parse()
        .with_context(|| format!("invalid bind address '{}'", config.server.bind))?;
    let app = api::router(api::state::AppState::new(orchestrator.clone()));

    tracing::info!(%addr, "taskpilot listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    orchestrator.shutdown();
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}
