//! Thin HTTP surface over the session manager: the turn endpoint, a health
//! probe, and a websocket stream of delivered segments. Everything else
//! (static assets, auth, share links) lives outside this service.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::config::AppConfig;
use crate::session::{SessionManager, TurnResponse, TurnStatus};

#[derive(Clone)]
pub struct ServerState {
    pub sessions: Arc<SessionManager>,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Deserialize)]
pub struct TurnApiRequest {
    pub user_id: String,
    pub bot_id: i64,
    pub message: String,
    #[serde(default)]
    pub client_turn_id: Option<String>,
}

pub async fn serve(sessions: Arc<SessionManager>, config: Arc<AppConfig>) -> Result<()> {
    let bind_addr = config
        .bind_addr
        .parse::<SocketAddr>()
        .with_context(|| format!("Invalid bind address {}", config.bind_addr))?;

    let state = ServerState { sessions };
    let app = Router::new()
        .route("/health", get(health))
        .route("/turn", post(post_turn))
        .route("/ws/events", get(ws_events_route))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", bind_addr))?;
    tracing::info!("rapport backend listening on http://{}", bind_addr);
    axum::serve(listener, app).await.context("Server failed")?;
    Ok(())
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

async fn post_turn(
    State(state): State<ServerState>,
    Json(body): Json<TurnApiRequest>,
) -> Result<Json<TurnResponse>, (StatusCode, String)> {
    if body.message.trim().is_empty() {
        return Err((StatusCode::BAD_REQUEST, "message cannot be empty".to_string()));
    }

    let receiver = state
        .sessions
        .submit(body.bot_id, &body.user_id, body.message)
        .await;

    let response = receiver.await.map_err(|_| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            "turn dropped without a response".to_string(),
        )
    })?;

    // Superseded is not an error to the caller; real failures are 5xx.
    match response.status {
        TurnStatus::Error => Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            response
                .error
                .unwrap_or_else(|| "turn failed".to_string()),
        )),
        _ => Ok(Json(response)),
    }
}

async fn ws_events_route(
    State(state): State<ServerState>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let rx = state.sessions.subscribe_events();
    ws.on_upgrade(move |socket| handle_events_socket(socket, rx))
}

async fn handle_events_socket(
    mut socket: WebSocket,
    mut rx: broadcast::Receiver<crate::session::SegmentEvent>,
) {
    loop {
        tokio::select! {
            result = rx.recv() => {
                match result {
                    Ok(event) => {
                        let payload = match serde_json::to_string(&event) {
                            Ok(serialized) => serialized,
                            Err(error) => {
                                tracing::warn!("Failed to serialize segment event: {}", error);
                                continue;
                            }
                        };
                        if socket.send(Message::Text(payload)).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            incoming = socket.next() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }
}
