//! autotest -- background browser test runs with live event streams.
//!
//! This crate provides the run queue, the browser orchestrator, the stream
//! reconciler that serves live and finished runs, and the SQLite run store
//! behind them.

pub mod api;
pub mod browser;
pub mod config;
pub mod model;
pub mod queue;
pub mod runner;
pub mod storage;
pub mod stream;

use std::sync::Arc;

use anyhow::{Context, Result};

use crate::api::state::AppState;
use crate::browser::{RemoteAgent, WebDriverClient};
use crate::config::AppConfig;
use crate::queue::TestQueue;
use crate::runner::Orchestrator;
use crate::storage::{RunStore, SqliteRunStore};
use crate::stream::StreamReconciler;

/// Start the autotest daemon: run store, queue, and API server.
pub async fn serve(config: AppConfig) -> Result<()> {
    // 1. Initialize Storage
    tracing::info!(db_path = %config.storage.db_path, "Initializing database");
    let pool = storage::open_pool(&config.storage.db_path)?;
    let store: Arc<dyn RunStore> = Arc::new(SqliteRunStore::new(pool));

    // 2. Browser capability
    let driver = WebDriverClient::new(config.driver.clone()).context("failed to build WebDriver client")?;
    let engine = RemoteAgent::new(&config.agent).context("failed to build engine client")?;
    let executor = Arc::new(Orchestrator::new(Arc::new(driver), Arc::new(engine)));

    // 3. Queue and live streams
    let settings = config.queue.settings();
    tracing::info!(
        concurrency = settings.concurrency,
        job_timeout_secs = settings.job_timeout.as_secs(),
        "Starting run queue"
    );
    let queue = TestQueue::new(settings, store.clone(), executor);
    let streams = StreamReconciler::new(
        queue.clone(),
        store.clone(),
        config.stream.poll_interval(),
        config.stream.orphan_grace(),
    );

    // 4. Start API Server
    let addr: std::net::SocketAddr = config
        .server
        .bind
        .parse()
        .with_context(|| format!("invalid bind address '{}'", config.server.bind))?;
    let app = api::router(AppState {
        store,
        queue,
        streams,
    });

    tracing::info!(%addr, "autotest listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown requested");
}
