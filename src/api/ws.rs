// WebSocket handler streaming lifecycle render instructions.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use tokio::sync::broadcast::error::RecvError;

use super::AppState;
use crate::metrics;
use crate::presentation::Snapshot;

/// WebSocket upgrade handler for status streaming.
pub async fn ws_status(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws(socket, state))
}

fn encode(snapshot: &Snapshot) -> Option<String> {
    match serde_json::to_string(snapshot) {
        Ok(text) => Some(text),
        Err(e) => {
            tracing::error!("Failed to encode snapshot: {e}");
            None
        }
    }
}

async fn handle_ws(mut socket: WebSocket, state: AppState) {
    // Subscribe before reading the current snapshot so nothing falls in between.
    let mut rx = state.sink.subscribe();
    metrics::CONNECTED_WEBSOCKETS.inc();

    // Late joiners see the current instruction immediately.
    let current = state.sink.current_snapshot();
    let mut last_revision = current.revision;
    if let Some(text) = encode(&current) {
        if socket.send(Message::Text(text.into())).await.is_err() {
            metrics::CONNECTED_WEBSOCKETS.dec();
            return;
        }
    }

    loop {
        tokio::select! {
            result = rx.recv() => {
                match result {
                    Ok(snapshot) => {
                        // Renders older than what was already sent are skipped; refreshes
                        // of the same revision are forwarded.
                        if snapshot.revision < last_revision {
                            continue;
                        }
                        last_revision = snapshot.revision;
                        let Some(text) = encode(&snapshot) else { continue };
                        if socket.send(Message::Text(text.into())).await.is_err() {
                            // Client disconnected
                            break;
                        }
                    }
                    Err(RecvError::Closed) => break,
                    Err(RecvError::Lagged(n)) => {
                        tracing::warn!("WebSocket client lagged, skipped {n} updates");
                    }
                }
            }
            // Client messages are ignored; only used to detect disconnect.
            result = socket.recv() => {
                match result {
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }

    metrics::CONNECTED_WEBSOCKETS.dec();
}
