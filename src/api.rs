//! HTTP control surface for the supervisor

use std::future::Future;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info};

use crate::supervisor::{StartStatus, StreamSupervisor, StreamTarget};
use crate::OutputConfig;

#[derive(Clone)]
pub struct ApiState {
    pub supervisor: Arc<StreamSupervisor>,
    /// Used for fields a start request leaves out
    pub defaults: OutputConfig,
}

#[derive(Debug, Default, Deserialize)]
pub struct StartRequest {
    pub rtmp_url: Option<String>,
    pub backup_rtmp_url: Option<String>,
    pub stream_key: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct StartResponse {
    pub status: StartStatus,
}

fn pick(requested: Option<String>, fallback: Option<&String>) -> Option<String> {
    requested
        .filter(|v| !v.trim().is_empty())
        .or_else(|| fallback.filter(|v| !v.trim().is_empty()).cloned())
}

impl StartRequest {
    fn target(self, defaults: &OutputConfig) -> Option<StreamTarget> {
        Some(StreamTarget {
            primary: pick(self.rtmp_url, Some(&defaults.primary))?,
            backup: pick(self.backup_rtmp_url, defaults.backup.as_ref()),
            stream_key: pick(self.stream_key, defaults.stream_key.as_ref()),
        })
    }
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/api/stream/start", post(start_stream))
        .route("/api/stream/stop", post(stop_stream))
        .route("/api/stream/status", get(stream_status))
        .route("/api/stream/logs", get(stream_logs))
        .route("/ws/logs", get(log_socket))
        .with_state(state)
}

/// Serve the API on `bind` until `shutdown` resolves.
pub async fn serve(
    bind: &str,
    state: ApiState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .map_err(|e| eyre!("Failed to bind {}: {}", bind, e))?;
    info!("Control API listening on http://{}", bind);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| eyre!("Control API failed: {}", e))
}

async fn start_stream(
    State(state): State<ApiState>,
    body: Option<Json<StartRequest>>,
) -> impl IntoResponse {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    let Some(target) = request.target(&state.defaults) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "no RTMP URL given or configured" })),
        )
            .into_response();
    };

    match state.supervisor.start(target).await {
        Ok(status) => Json(StartResponse { status }).into_response(),
        Err(e) => {
            error!("Failed to start stream: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": e.to_string() })),
            )
                .into_response()
        }
    }
}

async fn stop_stream(State(state): State<ApiState>) -> Json<serde_json::Value> {
    state.supervisor.stop().await;
    Json(json!({ "status": "stopped" }))
}

async fn stream_status(State(state): State<ApiState>) -> Json<serde_json::Value> {
    Json(json!({ "running": state.supervisor.status().await }))
}

async fn stream_logs(State(state): State<ApiState>) -> Json<serde_json::Value> {
    Json(json!({ "lines": state.supervisor.recent_logs() }))
}

async fn log_socket(ws: WebSocketUpgrade, State(state): State<ApiState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| forward_logs(socket, state.supervisor))
}

/// Push log lines until the client goes away or falls behind.
async fn forward_logs(mut socket: WebSocket, supervisor: Arc<StreamSupervisor>) {
    let mut feed = supervisor.subscribe();
    loop {
        tokio::select! {
            line = feed.recv() => match line {
                Ok(line) => {
                    let msg = json!({ "log": line }).to_string();
                    if socket.send(Message::Text(msg)).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(n)) => {
                    debug!("Log subscriber lagged by {} lines, dropping", n);
                    break;
                }
                Err(RecvError::Closed) => break,
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => {}
            },
        }
    }
}
