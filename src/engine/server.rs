use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{Router, routing::get};
use tokio::sync::broadcast;
use tower_http::cors::CorsLayer;

use crate::config::EngineConfig;

use super::api::{self, AppState};
use super::db::{DbHandle, EngineDb};
use super::orchestrator::BuildOrchestrator;
use super::workspace::WorkspaceManager;
use super::ws;

/// Build the full application router with API and WebSocket endpoints.
pub fn build_router(state: Arc<AppState>) -> Router {
    let ws_tx = state.ws_tx.clone();

    api::api_router()
        .route(
            "/ws",
            get(move |ws_upgrade| ws::ws_handler_with_sender(ws_upgrade, ws_tx)),
        )
        .with_state(state)
}

/// Wire up the engine from configuration: database, workspace manager,
/// orchestrator, shared state.
pub fn build_state(config: &EngineConfig) -> Result<Arc<AppState>> {
    if let Some(parent) = config.db_path.parent() {
        std::fs::create_dir_all(parent).context("Failed to create database directory")?;
    }
    std::fs::create_dir_all(&config.workspaces_root)
        .context("Failed to create workspaces root")?;

    let db = DbHandle::new(
        EngineDb::new(&config.db_path).context("Failed to initialize engine database")?,
    );
    let (ws_tx, _rx) = broadcast::channel::<String>(256);
    let workspaces = Arc::new(WorkspaceManager::new(config.workspaces_root.clone()));
    let orchestrator = Arc::new(BuildOrchestrator::new(
        db.clone(),
        workspaces,
        ws_tx.clone(),
        config,
    ));

    Ok(Arc::new(AppState {
        db,
        orchestrator,
        ws_tx,
    }))
}

/// Start the engine server and serve until interrupted. In-flight builds are
/// allowed to reach a terminal state before the process exits.
pub async fn start_server(config: EngineConfig) -> Result<()> {
    let state = build_state(&config)?;
    let orchestrator = Arc::clone(&state.orchestrator);

    let mut app = build_router(state);
    if config.dev_mode {
        app = app.layer(CorsLayer::permissive());
    }

    let host = if config.dev_mode { "0.0.0.0" } else { "127.0.0.1" };
    let addr = format!("{}:{}", host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    tracing::info!("Anvil engine listening on http://{}", local_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    tracing::info!("Waiting for in-flight builds to finish");
    orchestrator.wait_for_idle().await;
    tracing::info!("Server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to install Ctrl+C handler: {}", e);
        return;
    }
    tracing::info!("Shutting down");
}
