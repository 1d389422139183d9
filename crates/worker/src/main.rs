//! deskchat background worker
//!
//! Runs the backstop sweeps on a schedule against the shared database.

mod config;
mod sweeper;

use anyhow::Context;
use deskchat_engine::{ChatEngine, EventReceiver, PgChatStore};
use deskchat_shared::create_pool;
use std::sync::Arc;
use tokio_cron_scheduler::JobScheduler;
use tracing_subscriber::EnvFilter;

use config::WorkerConfig;
use sweeper::Sweeper;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("deskchat_worker=info,deskchat_engine=info,warn"));
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    let config = WorkerConfig::from_env().context("invalid configuration")?;

    // Migrations are owned by the API server
    let pool = create_pool(&config.database_url, config.database_max_connections)
        .await
        .context("failed to connect to database")?;

    let store = Arc::new(PgChatStore::new(pool));
    let (engine, events) = ChatEngine::start(store)
        .await
        .context("failed to start chat engine")?;
    let drain = tokio::spawn(log_events(events));

    let mut scheduler = JobScheduler::new()
        .await
        .context("failed to create scheduler")?;
    Sweeper::new(engine.clone())
        .schedule(&scheduler, &config)
        .await
        .context("failed to schedule sweeps")?;
    scheduler.start().await.context("failed to start scheduler")?;
    tracing::info!("deskchat worker started");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("Shutdown signal received");

    if let Err(e) = scheduler.shutdown().await {
        tracing::error!(error = %e, "Scheduler shutdown failed");
    }
    engine.shutdown();
    drain.abort();

    tracing::info!("deskchat worker stopped");
    Ok(())
}

/// No sockets are attached here; browsers pick up worker-side transitions
/// through the API's REST reads
async fn log_events(mut events: EventReceiver) {
    while let Some(event) = events.recv().await {
        tracing::debug!(
            session_id = %event.session_id(),
            event = event.kind(),
            "Chat event from sweep"
        );
    }
}
