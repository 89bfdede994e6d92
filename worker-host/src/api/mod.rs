use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use shared_types::{ClassifiedError, ErrorKind, ErrorPayload, InboundMessage, OutboundMessage};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::router::Endpoint;
use crate::state::{AppState, WorkerHub};

/// Routes for the UI transport. `main` adds tracing and serves it.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/models", get(list_models))
        .route("/api/param-finders", get(list_param_finders))
        .route("/ipc/{channel}", get(ipc_socket))
        .with_state(state)
}

/// GET /health
pub async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

/// GET /api/models: model pool status
pub async fn list_models(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.models.registry().status())
}

/// GET /api/param-finders: param-finder status
pub async fn list_param_finders(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.param_finders.registry().status())
}

/// GET /ipc/{channel}: WebSocket session for one worker channel
pub async fn ipc_socket(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Path(channel): Path<String>,
) -> Response {
    let Some(hub) = state.hub(&channel).cloned() else {
        return (StatusCode::NOT_FOUND, format!("unknown channel '{channel}'")).into_response();
    };
    ws.on_upgrade(move |socket| serve_socket(socket, hub))
}

/// Serializes outbound events into text frames for the socket writer.
struct SocketEndpoint {
    frames: mpsc::UnboundedSender<String>,
}

impl Endpoint for SocketEndpoint {
    fn send(&self, message: OutboundMessage) {
        queue_frame(&self.frames, &message);
    }
}

fn queue_frame<T: serde::Serialize>(frames: &mpsc::UnboundedSender<String>, value: &T) {
    match serde_json::to_string(value) {
        Ok(text) => {
            if frames.send(text).is_err() {
                debug!("socket writer gone; frame dropped");
            }
        }
        Err(e) => warn!("failed to serialize outbound frame: {e}"),
    }
}

async fn serve_socket(socket: WebSocket, hub: WorkerHub) {
    let channel = hub.sender.name();
    let (mut sink, mut stream) = socket.split();
    let (frames_tx, mut frames_rx) = mpsc::unbounded_channel::<String>();

    let endpoint_id = hub.router.start(Arc::new(SocketEndpoint {
        frames: frames_tx.clone(),
    }));
    info!(channel, "UI connected");

    let writer = tokio::spawn(async move {
        while let Some(text) = frames_rx.recv().await {
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => handle_frame(&hub, &frames_tx, text.as_str()).await,
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(channel, "socket read failed: {e}");
                break;
            }
        }
    }

    hub.router.stop_endpoint(endpoint_id);
    writer.abort();
    info!(channel, "UI disconnected");
}

async fn handle_frame(hub: &WorkerHub, frames: &mpsc::UnboundedSender<String>, text: &str) {
    let message = match serde_json::from_str::<InboundMessage>(text) {
        Ok(message) => message,
        Err(e) => {
            warn!(channel = hub.sender.name(), "malformed command frame: {e}");
            let payload = ErrorPayload {
                error: ClassifiedError {
                    kind: ErrorKind::InvalidRequest,
                    message: format!("malformed command: {e}"),
                    diagnostic: None,
                },
                originating_command: None,
            };
            queue_frame(frames, &OutboundMessage::error("", &payload));
            return;
        }
    };

    // Awaiting each command keeps one socket's commands in order.
    match hub.sender.invoke(message).await {
        Ok(Some(list)) => queue_frame(frames, &list),
        Ok(None) => {}
        Err(e) => warn!("{e}"),
    }
}
