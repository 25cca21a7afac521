//! WebSocket transport and HTTP surface.
//!
//! The WebSocket endpoint (`/ws`) upgrades and bridges the socket to the
//! event dispatcher: one task per connection reads client frames and
//! drains the session's outbound queue. The rest of the router serves the
//! static web client and a small health endpoint.

use std::sync::Arc;

use axum::Router;
use axum::extract::ws::{Message as WsMessage, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use serde::Serialize;
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;

use crate::connection::{self, dispatch};
use crate::events::{ClientEvent, ServerEvent, WireMessage};
use crate::server::{SEND_BUFFER, SharedState};

pub fn build_router(state: Arc<SharedState>) -> Router {
    let mut app = Router::new()
        .route("/ws", get(ws_upgrade))
        .route("/api/messages", get(api_messages))
        .route("/api/v1/health", get(api_health))
        .layer(CorsLayer::permissive());

    let static_dir = std::path::PathBuf::from(&state.config.static_dir);
    if static_dir.exists() {
        tracing::info!("serving web client from {}", static_dir.display());
        app = app.fallback_service(ServeDir::new(&static_dir));
    }

    app.with_state(state)
}

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<Arc<SharedState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws(socket, state))
}

/// Drive one client connection until either side closes.
///
/// The session is registered before the first frame is read so broadcasts
/// fired during its own dispatch reach it too.
async fn handle_ws(mut socket: WebSocket, state: Arc<SharedState>) {
    let session_id = format!("session-{:016x}", rand::random::<u64>());
    let (tx, mut rx) = mpsc::channel::<ServerEvent>(SEND_BUFFER);
    state.connections.lock().insert(session_id.clone(), tx);
    tracing::debug!(session_id, "client connected");

    loop {
        tokio::select! {
            frame = socket.recv() => {
                match frame {
                    Some(Ok(WsMessage::Text(text))) => {
                        match serde_json::from_str::<ClientEvent>(&text) {
                            Ok(event) => dispatch(&state, &session_id, event),
                            Err(e) => {
                                tracing::debug!(session_id, error = %e, "unparseable frame");
                                state.send_to(
                                    &session_id,
                                    ServerEvent::Error { message: "Malformed event".to_string() },
                                );
                            }
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Ok(_)) => {} // ping/pong handled by axum
                    Some(Err(_)) => break,
                }
            }
            event = rx.recv() => {
                match event {
                    Some(event) => {
                        let Ok(json) = serde_json::to_string(&event) else { continue };
                        if socket.send(WsMessage::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
    }

    connection::handle_disconnect(&state, &session_id);
    tracing::debug!(session_id, "client disconnected");
}

/// Read-only dump of the full message log, oldest first.
async fn api_messages(
    State(state): State<Arc<SharedState>>,
) -> Result<Json<Vec<WireMessage>>, axum::http::StatusCode> {
    match state.with_db(|db| db.all_messages()) {
        Ok(rows) => Ok(Json(rows.into_iter().map(WireMessage::from).collect())),
        Err(e) => {
            tracing::error!(error = %e, "message dump failed");
            Err(axum::http::StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

#[derive(Serialize)]
struct HealthResponse {
    connections: usize,
    worker: String,
}

async fn api_health(State(state): State<Arc<SharedState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        connections: state.connections.lock().len(),
        worker: state.relay.origin().to_string(),
    })
}
