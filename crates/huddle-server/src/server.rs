use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use huddle_core::ClientIdentity;
use huddle_telemetry::MetricsRecorder;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::room::ChatRoom;
use crate::session::Session;
use crate::transport::{CloseNotice, FrameSink};
use crate::ws::{self, SESSION_ENDED};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub room: Arc<ChatRoom>,
    pub config: Arc<ServerConfig>,
}

impl AppState {
    pub fn new(config: ServerConfig, metrics: Arc<MetricsRecorder>) -> Self {
        Self {
            room: Arc::new(ChatRoom::new(config.duplicate_policy, metrics)),
            config: Arc::new(config),
        }
    }
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root_handler))
        .route("/health", get(health_handler))
        .route("/api/v1/chat/ws/{username}", get(ws_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Bind, spawn the server and return a handle to it.
pub async fn start(
    config: ServerConfig,
    metrics: Arc<MetricsRecorder>,
) -> Result<ServerHandle, ServerError> {
    config.validate()?;
    let listener = tokio::net::TcpListener::bind(config.bind_addr()).await?;
    let local_addr = listener.local_addr()?;

    let state = AppState::new(config, metrics);
    let room = Arc::clone(&state.room);
    let router = build_router(state);

    let shutdown = CancellationToken::new();
    let server_shutdown = shutdown.clone();
    let server = tokio::spawn(async move {
        let result = axum::serve(listener, router)
            .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
            .await;
        if let Err(e) = result {
            warn!(error = %e, "server exited with error");
        }
    });

    info!(addr = %local_addr, "chat server started");

    Ok(ServerHandle {
        local_addr,
        room,
        shutdown,
        server,
    })
}

/// Handle returned by `start()`; keeps the server task alive.
pub struct ServerHandle {
    local_addr: SocketAddr,
    room: Arc<ChatRoom>,
    shutdown: CancellationToken,
    server: tokio::task::JoinHandle<()>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn room(&self) -> &Arc<ChatRoom> {
        &self.room
    }

    /// Close every client, stop accepting, and wait for the server task.
    pub async fn shutdown(self) {
        self.room.close_all(CloseNotice::GOING_AWAY).await;
        self.shutdown.cancel();
        if tokio::time::timeout(SHUTDOWN_TIMEOUT, self.server).await.is_err() {
            warn!("server did not stop within shutdown timeout");
        }
        info!("chat server stopped");
    }
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(username): Path<String>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.max_message_size(state.config.max_message_size)
        .on_upgrade(move |socket| handle_socket(socket, ClientIdentity::from(username), state))
}

/// Run one chat session over an upgraded socket.
async fn handle_socket(socket: WebSocket, identity: ClientIdentity, state: AppState) {
    let (sink, source) = ws::accept(socket, &state.config);
    let session = Session::new(identity, sink.clone(), source);
    let summary = session.run(&state.room).await;
    sink.close(SESSION_ENDED).await;
    info!(
        identity = %summary.identity,
        conn_id = %summary.connection_id,
        frames = summary.frames_relayed,
        end = ?summary.end,
        "websocket session finished"
    );
}

async fn root_handler() -> impl IntoResponse {
    Json(json!({ "message": "Chat Service is running" }))
}

/// Health check HTTP endpoint.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "connections": state.room.registry().len(),
        "metrics": state.room.metrics().snapshot(),
    }))
}
