use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::types::{ClientMessage, ServerMessage};
use crate::AppState;

/// Symbols a client follows; empty means every stream.
type Follows = Arc<RwLock<HashSet<String>>>;

/// WebSocket upgrade handler.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let client_id = Uuid::new_v4();
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();
    let follows: Follows = Arc::new(RwLock::new(HashSet::new()));
    info!("WebSocket client connected: {}", client_id);

    // Forward queued messages to the socket
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let json = match serde_json::to_string(&msg) {
                Ok(json) => json,
                Err(e) => {
                    error!("Failed to encode WebSocket message: {}", e);
                    continue;
                }
            };
            if sender.send(Message::Text(json)).await.is_err() {
                break;
            }
        }
    });

    // Snapshot on connect and every push interval, plus each newly closed candle
    let push_task = {
        let tx = tx.clone();
        let follows = Arc::clone(&follows);
        let candles = Arc::clone(&state.candles);
        let mut candle_rx = candles.subscribe();
        let mut ticker = tokio::time::interval(state.config.price_push_interval);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let data = candles
                            .latest_prices()
                            .into_iter()
                            .filter(|p| is_followed(&follows.read(), &p.symbol))
                            .collect();
                        if tx.send(ServerMessage::PriceUpdate { data }).is_err() {
                            break;
                        }
                    }
                    received = candle_rx.recv() => match received {
                        Ok(candle) => {
                            if !is_followed(&follows.read(), &candle.symbol) {
                                continue;
                            }
                            if tx.send(ServerMessage::CandleClosed { data: candle }).is_err() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!("WebSocket client {} lagged, skipped {} candles", client_id, skipped);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        })
    };

    // Handle incoming messages
    while let Some(result) = receiver.next().await {
        match result {
            Ok(Message::Text(text)) => {
                debug!("Received message from {}: {}", client_id, text);
                let reply = handle_message(&follows, &text);
                if tx.send(reply).is_err() {
                    break;
                }
            }
            Ok(Message::Close(_)) => {
                info!("WebSocket client disconnecting: {}", client_id);
                break;
            }
            Err(e) => {
                error!("WebSocket error for {}: {}", client_id, e);
                break;
            }
            _ => {}
        }
    }

    send_task.abort();
    push_task.abort();
    info!("WebSocket client disconnected: {}", client_id);
}

fn handle_message(follows: &Follows, text: &str) -> ServerMessage {
    let msg: ClientMessage = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            return ServerMessage::Error {
                error: format!("Invalid message: {}", e),
            }
        }
    };

    let mut set = follows.write();
    match msg {
        ClientMessage::Subscribe { symbols } => {
            set.extend(symbols.iter().map(|s| s.trim().to_uppercase()));
        }
        ClientMessage::Unsubscribe { symbols } => {
            for symbol in &symbols {
                set.remove(&symbol.trim().to_uppercase());
            }
        }
    }

    let mut symbols: Vec<String> = set.iter().cloned().collect();
    symbols.sort();
    ServerMessage::Subscribed { symbols }
}

fn is_followed(follows: &HashSet<String>, symbol: &str) -> bool {
    follows.is_empty() || follows.contains(symbol)
}
