//! deskchat API server

use anyhow::Context;
use deskchat_api::{routes::create_router, websocket::spawn_event_pump, AppState, Config};
use deskchat_engine::{ChatEngine, PgChatStore};
use deskchat_shared::{create_pool, run_migrations};
use std::{sync::Arc, time::Duration};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env when present; real deployments set the environment directly
    let _ = dotenvy::dotenv();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("deskchat_api=info,deskchat_engine=info,tower_http=info,warn"));
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    let config = Config::from_env().context("invalid configuration")?;

    let pool = create_pool(&config.database_url, config.database_max_connections)
        .await
        .context("failed to connect to database")?;
    run_migrations(&pool).await.context("failed to run migrations")?;
    tracing::info!("Database migrations applied");

    let store = Arc::new(PgChatStore::new(pool));
    let (engine, events) = ChatEngine::start(store)
        .await
        .context("failed to start chat engine")?;

    let state = AppState::new(config, engine.clone());
    let pump = spawn_event_pump(events, state.ws_state.clone());
    let refresher = spawn_settings_refresh(
        engine.clone(),
        Duration::from_secs(state.config.settings_refresh_seconds),
    );

    let listener = tokio::net::TcpListener::bind(&state.config.bind_address)
        .await
        .with_context(|| format!("failed to bind {}", state.config.bind_address))?;
    tracing::info!(address = %state.config.bind_address, "deskchat API listening");

    let app = create_router(state);
    let serve_result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    refresher.abort();
    engine.shutdown();
    pump.abort();
    serve_result.context("API server exited unexpectedly")?;

    tracing::info!("deskchat API stopped");
    Ok(())
}

/// Periodically re-read recovery settings so admin edits made through
/// another instance take effect here
fn spawn_settings_refresh(engine: ChatEngine, every: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // First tick completes immediately; settings were loaded at startup
        interval.tick().await;
        loop {
            interval.tick().await;
            if let Err(e) = engine.settings().refresh().await {
                tracing::error!(error = %e, "Recovery settings refresh failed");
            }
        }
    })
}

/// Resolve on Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
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
    tracing::info!("Shutdown signal received");
}
