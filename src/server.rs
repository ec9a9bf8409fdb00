//! Server assembly: wires the store, event bus, orchestrator, and scheduler
//! together and serves the HTTP API.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{Router, routing::get};
use tower_http::cors::CorsLayer;

use crate::api::{self, AppState, SharedState};
use crate::config::ServerConfig;
use crate::events::EventBus;
use crate::orchestrator::Orchestrator;
use crate::scheduler::Scheduler;
use crate::store::{DbHandle, StateStore};

pub fn build_state(config: &ServerConfig, store: StateStore) -> SharedState {
    let db = DbHandle::new(store);
    let bus = Arc::new(EventBus::new());
    let orchestrator = Arc::new(Orchestrator::new(db.clone(), Arc::clone(&bus)));
    let scheduler = Arc::new(
        Scheduler::new(db.clone(), Arc::clone(&orchestrator), config.max_concurrent)
            .poll_interval(config.scheduler_poll_interval),
    );
    Arc::new(AppState {
        db,
        bus,
        orchestrator,
        scheduler,
        runtime: config.runtime.clone(),
    })
}

pub fn build_router(state: SharedState) -> Router {
    Router::new()
        .route("/health", get(health))
        .nest("/api/v1", api::api_router())
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

pub async fn start_server(config: ServerConfig) -> Result<()> {
    if let Some(parent) = config.db_path.parent() {
        std::fs::create_dir_all(parent).context("Failed to create database directory")?;
    }
    let store = StateStore::open(&config.db_path).context("Failed to open state store")?;
    let state = build_state(&config, store);

    let heartbeat = state.bus.spawn_heartbeat(config.heartbeat_interval);

    let mut app = build_router(Arc::clone(&state));
    if config.dev_mode {
        app = app.layer(CorsLayer::permissive());
    }

    let host = if config.dev_mode { "0.0.0.0" } else { "127.0.0.1" };
    let addr = format!("{host}:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {addr}"))?;
    tracing::info!("vibecc listening at http://{}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    heartbeat.abort();
    tracing::info!("server shut down");
    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_err() {
        tracing::error!("failed to install ctrl-c handler; running until killed");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}
