use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use relay_broker::{Broker, BrokerConfig, BrokerHandle, Session};
use relay_core::{IdGenerator, Identifier};
use relay_telemetry::MetricsRecorder;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::client::{self, HEARTBEAT_INTERVAL};
use crate::error::ServerError;

pub const ID_ERRORS_TOTAL: &str = "relay_id_errors_total";

/// Server configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Outbound queue capacity per session.
    pub max_send_queue: usize,
    pub mailbox_capacity: usize,
    pub heartbeat_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8080,
            max_send_queue: 256,
            mailbox_capacity: 1024,
            heartbeat_interval: HEARTBEAT_INTERVAL,
        }
    }
}

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub broker: BrokerHandle,
    pub ids: Arc<IdGenerator>,
    pub metrics: Arc<MetricsRecorder>,
    pub max_send_queue: usize,
    pub heartbeat_interval: Duration,
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Bind the listener, start the broker, and serve until shut down.
pub async fn start(
    config: ServerConfig,
    ids: Arc<IdGenerator>,
    metrics: Arc<MetricsRecorder>,
) -> Result<ServerHandle, ServerError> {
    let (broker, broker_task) = Broker::spawn(
        BrokerConfig {
            mailbox_capacity: config.mailbox_capacity,
        },
        Arc::clone(&metrics),
    );

    let state = AppState {
        broker: broker.clone(),
        ids,
        metrics,
        max_send_queue: config.max_send_queue,
        heartbeat_interval: config.heartbeat_interval,
    };
    let router = build_router(state);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|source| ServerError::Bind {
            addr: addr.clone(),
            source,
        })?;
    let local_addr = listener.local_addr()?;

    tracing::info!(addr = %local_addr, "Relay server started");

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    let server = tokio::spawn(async move {
        let result = axum::serve(listener, router)
            .with_graceful_shutdown(async move { signal.cancelled().await })
            .await;
        if let Err(e) = result {
            tracing::error!(error = %e, "HTTP server failed");
        }
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        broker,
        shutdown,
        server,
        broker_task,
    })
}

/// Handle returned by `start()`. Keeps background tasks alive.
pub struct ServerHandle {
    pub port: u16,
    broker: BrokerHandle,
    shutdown: CancellationToken,
    server: JoinHandle<()>,
    broker_task: JoinHandle<()>,
}

impl ServerHandle {
    pub fn broker(&self) -> &BrokerHandle {
        &self.broker
    }

    /// Stop accepting connections, let the broker finish queued operations,
    /// close every session queue, and wait for the HTTP task to exit.
    pub async fn shutdown(self, timeout: Duration) -> Result<(), ServerError> {
        self.shutdown.cancel();
        match self.broker.shutdown().await {
            Ok(closed) => tracing::info!(closed, "Closed session queues"),
            Err(e) => tracing::warn!(error = %e, "Broker already stopped"),
        }

        let drain = async {
            let _ = self.broker_task.await;
            let _ = self.server.await;
        };
        tokio::time::timeout(timeout, drain)
            .await
            .map_err(|_| ServerError::ShutdownTimeout(timeout))
    }
}

/// WebSocket upgrade handler. The session id is assigned before the
/// upgrade so a clock failure rejects the connection outright.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    let id = match next_session_id(&state).await {
        Some(id) => id,
        None => {
            return (StatusCode::SERVICE_UNAVAILABLE, "session id unavailable").into_response();
        }
    };
    ws.on_upgrade(move |socket| handle_socket(socket, id, state))
}

async fn next_session_id(state: &AppState) -> Option<Identifier> {
    let ids = Arc::clone(&state.ids);
    match tokio::task::spawn_blocking(move || ids.next_id()).await {
        Ok(Ok(id)) => Some(id),
        Ok(Err(e)) => {
            state.metrics.increment_counter(ID_ERRORS_TOTAL, 1);
            tracing::error!(error = %e, kind = e.error_kind(), "Rejecting connection");
            None
        }
        Err(e) => {
            tracing::error!(error = %e, "Id generation task failed");
            None
        }
    }
}

/// Register the session for a completed handshake and run it.
async fn handle_socket(socket: WebSocket, id: Identifier, state: AppState) {
    let (session, rx) = Session::new(id, state.max_send_queue);
    if let Err(e) = state.broker.register(Arc::clone(&session)).await {
        tracing::warn!(session_id = %id, error = %e, "Register failed, dropping connection");
        return;
    }
    tracing::info!(session_id = %id, "WebSocket client connected");

    client::handle_ws_connection(socket, session, rx, state.broker, state.heartbeat_interval)
        .await;
}

/// Health check HTTP endpoint.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    match state.broker.stats().await {
        Ok(stats) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "healthy",
                "sessions": stats.sessions,
                "channels": stats.channels,
            })),
        ),
        Err(_) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "status": "stopped" })),
        ),
    }
}

async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.metrics.snapshot())
}
