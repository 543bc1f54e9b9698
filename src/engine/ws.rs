//! WebSocket event fan-out.
//!
//! Build lifecycle events are serialized once and pushed through a tokio
//! broadcast channel; every connected socket gets its own receiver. Lagging
//! receivers skip messages rather than stalling the engine.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use super::models::Build;

// ── WebSocket message types ──────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum WsMessage {
    RepoRegistered {
        owner: String,
        name: String,
    },
    /// Emitted once the two-phase acceptance write completes; the build is
    /// `running` (possibly still queued for a worker or workspace).
    BuildStarted {
        build: Build,
    },
    /// Emitted when the build reaches a terminal state.
    BuildFinished {
        build: Build,
    },
}

/// Serialize and send a message to all connected clients. Send errors mean
/// "no receivers" and are ignored.
pub fn broadcast_message(tx: &broadcast::Sender<String>, msg: &WsMessage) {
    match serde_json::to_string(msg) {
        Ok(json) => {
            let _ = tx.send(json);
        }
        Err(e) => tracing::warn!("Failed to serialize ws message: {}", e),
    }
}

pub async fn ws_handler_with_sender(
    ws: WebSocketUpgrade,
    tx: broadcast::Sender<String>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, tx))
}

async fn handle_socket(socket: WebSocket, tx: broadcast::Sender<String>) {
    let (mut sender, mut receiver) = socket.split();
    let mut rx = tx.subscribe();

    loop {
        tokio::select! {
            msg = rx.recv() => match msg {
                Ok(text) => {
                    if sender.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("ws client lagged, skipped {} messages", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(_)) => break,
            },
        }
    }
}
