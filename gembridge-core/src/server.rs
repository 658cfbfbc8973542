//! WebSocket listener: axum router, upgrade handler with replay query
//! parameters, and the server entry point.

use crate::bridge::{self, BridgeState, ReplayQuery};
use crate::config::BridgeConfig;
use crate::supervisor;
use anyhow::{Context, Result};
use axum::{
    extract::{ws::WebSocketUpgrade, Query, State},
    response::IntoResponse,
    routing::get,
    Router,
};
use futures::StreamExt;
use tracing::{debug, info};
use uuid::Uuid;

pub async fn start_bridge_server(mut config: BridgeConfig) -> Result<()> {
    config.project_root = std::fs::canonicalize(&config.project_root)
        .with_context(|| format!("bad project root {:?}", config.project_root))?;

    let state = BridgeState::new(config)?;
    state.log_line("bridge starting");

    supervisor::spawn_agent(state.clone())
        .await
        .context("failed to start agent process")?;

    let port = state.config.port;
    let app = Router::new()
        .route("/ws", get(ws_handler))
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind(("127.0.0.1", port))
        .await
        .with_context(|| format!("failed to bind port {}", port))?;
    info!("Bridge listening on ws://127.0.0.1:{}/ws", port);

    let result = axum::serve(listener, app).await;

    state.lock_core().shutting_down = true;
    result.context("server error")
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<ReplayQuery>,
    State(state): State<BridgeState>,
) -> impl IntoResponse {
    let client_id = Uuid::new_v4();
    debug!("New WebSocket connection: {}", client_id);

    ws.on_upgrade(move |socket| async move {
        let (sender, receiver) = socket.split();
        bridge::handle_socket_io(sender, receiver, state, client_id, query).await;
    })
}
