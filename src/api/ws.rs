// =============================================================================
// WebSocket server (C11)
// =============================================================================
//
// Fan-in from the viewer-extended pub/sub channel into a broadcast channel,
// fanned back out to one task per connected client, each filtering by its
// own `symbol` query param. Shape ported from the teacher's `api/ws.rs`
// `tokio::select!` client loop, re-targeted from an order-update stream to
// a Redis-pubsub bridge.
// =============================================================================

use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use futures_util::SinkExt;
use futures_util::StreamExt;
use metrics::{decrement_gauge, increment_counter, increment_gauge};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::warn;

use crate::broadcaster::Broadcaster;
use crate::metrics::names;
use crate::redis_bus;

const CLOSE_CODE_MISSING_SYMBOL: u16 = 4400;

pub struct WsHub {
    tx: broadcast::Sender<Value>,
}

impl WsHub {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(1024);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Value> {
        self.tx.subscribe()
    }

    /// Single background task: subscribes once to the viewer-extended
    /// channel and fans every message out to every connected client.
    pub async fn run(&self, redis_url: &str, channel: &str) {
        loop {
            let mut pubsub = redis_bus::subscribe_with_retry(redis_url, channel).await;
            let mut stream = pubsub.on_message();
            while let Some(msg) = stream.next().await {
                let Ok(payload) = msg.get_payload::<String>() else {
                    continue;
                };
                if let Ok(value) = serde_json::from_str::<Value>(&payload) {
                    let _ = self.tx.send(value);
                }
            }
            warn!("ws hub: pubsub stream ended, reconnecting");
        }
    }
}

impl Default for WsHub {
    fn default() -> Self {
        Self::new()
    }
}

pub struct WsState {
    pub broadcaster: Arc<Broadcaster>,
    pub hub: Arc<WsHub>,
}

#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    pub symbol: Option<String>,
}

pub async fn ws_handler(
    State(state): State<Arc<WsState>>,
    Query(q): Query<StreamQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, q.symbol))
}

async fn handle_socket(mut socket: WebSocket, state: Arc<WsState>, symbol: Option<String>) {
    let Some(symbol) = symbol.filter(|s| !s.trim().is_empty()) else {
        let _ = socket
            .send(Message::Close(Some(CloseFrame {
                code: CLOSE_CODE_MISSING_SYMBOL,
                reason: "missing_symbol".into(),
            })))
            .await;
        return;
    };
    let symbol_upper = symbol.to_ascii_uppercase();

    increment_gauge!(names::WS_CONNECTIONS, 1.0);

    let initial = state.broadcaster.symbol_state(&symbol_upper);
    let snapshot_frame = serde_json::json!({
        "type": "snapshot",
        "symbol": symbol_upper,
        "viewer_state": initial,
    });
    if socket
        .send(Message::Text(snapshot_frame.to_string()))
        .await
        .is_err()
    {
        decrement_gauge!(names::WS_CONNECTIONS, 1.0);
        return;
    }
    increment_counter!(names::WS_MESSAGES_TOTAL, "type" => "snapshot");

    let mut rx = state.hub.subscribe();

    loop {
        tokio::select! {
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(err)) => {
                        warn!(error = %err, "ws: client read error");
                        increment_counter!(names::WS_ERRORS_TOTAL, "stage" => "read");
                        break;
                    }
                }
            }
            update = rx.recv() => {
                match update {
                    Ok(value) => {
                        let msg_symbol = value.get("symbol").and_then(|s| s.as_str()).unwrap_or_default();
                        if !msg_symbol.eq_ignore_ascii_case(&symbol_upper) {
                            continue;
                        }
                        let frame = serde_json::json!({
                            "type": "update",
                            "symbol": symbol_upper,
                            "viewer_state": value.get("viewer_state"),
                        });
                        if socket.send(Message::Text(frame.to_string())).await.is_err() {
                            break;
                        }
                        increment_counter!(names::WS_MESSAGES_TOTAL, "type" => "update");
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    decrement_gauge!(names::WS_CONNECTIONS, 1.0);
}
