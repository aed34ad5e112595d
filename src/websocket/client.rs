//! Per-Client I/O
//!
//! One reader task parses subscribe/unsubscribe commands and enforces the
//! pong deadline; one writer task drains the outbound queue, coalescing
//! queued frames into a single newline-separated text frame, and pings on a
//! timer. The hub closes the outbound channel to hang up on a client.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::time::{interval, timeout};
use tracing::debug;

use crate::AppState;

use super::{ClientCommand, ClientId, HubHandle, MAX_MESSAGE_SIZE, PING_PERIOD, PONG_WAIT, SEND_BUF, WRITE_WAIT};

#[derive(Debug, Deserialize)]
pub struct WsParams {
    /// Comma-separated symbols to subscribe on connect.
    #[serde(default)]
    pub symbols: String,
}

/// Upgrade handler. `GET /ws?symbols=ACMEUSD,BTCUSD`.
pub async fn serve_ws(
    ws: WebSocketUpgrade,
    Query(params): Query<WsParams>,
    State(state): State<Arc<AppState>>,
) -> Response {
    let hub = state.hub.clone();
    ws.max_message_size(MAX_MESSAGE_SIZE)
        .on_upgrade(move |socket| handle_socket(socket, hub, params.symbols))
}

async fn handle_socket(socket: WebSocket, hub: HubHandle, symbols: String) {
    let (ws_tx, ws_rx) = socket.split();
    let client = hub.next_client_id();

    let (out_tx, out_rx) = mpsc::channel::<String>(SEND_BUF);
    hub.register(client, out_tx).await;

    for symbol in symbols.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        hub.subscribe(client, symbol).await;
    }

    let writer = tokio::spawn(write_pump(ws_tx, out_rx));
    read_pump(ws_rx, &hub, client).await;

    // Reader done: drop our state; the closed channel ends the writer.
    hub.unregister(client).await;
    let _ = writer.await;
    debug!(client, "websocket closed");
}

/// Read loop. Every inbound frame resets the pong deadline; missing it, a
/// read error or a close frame ends the connection.
async fn read_pump(mut ws_rx: SplitStream<WebSocket>, hub: &HubHandle, client: ClientId) {
    loop {
        let msg = match timeout(PONG_WAIT, ws_rx.next()).await {
            Err(_) => {
                debug!(client, "pong deadline exceeded");
                return;
            }
            Ok(None) | Ok(Some(Err(_))) => return,
            Ok(Some(Ok(msg))) => msg,
        };

        match msg {
            Message::Text(text) => {
                let Ok(cmd) = serde_json::from_str::<ClientCommand>(&text) else {
                    debug!(client, "invalid client frame");
                    continue;
                };
                match cmd.kind.as_str() {
                    "subscribe" if !cmd.symbol.is_empty() => {
                        hub.subscribe(client, cmd.symbol).await;
                    }
                    "unsubscribe" if !cmd.symbol.is_empty() => {
                        hub.unsubscribe(client, cmd.symbol).await;
                    }
                    // Unknown commands are ignored.
                    _ => {}
                }
            }
            Message::Close(_) => return,
            // Pings are answered by the transport; pongs only reset the
            // deadline, which the timeout above already did.
            _ => {}
        }
    }
}

/// Write loop. Serializes all socket writes: queued payloads (coalesced,
/// newline-separated) and keepalive pings, each bounded by the write wait.
async fn write_pump(mut ws_tx: SplitSink<WebSocket, Message>, mut out_rx: mpsc::Receiver<String>) {
    let mut ping = interval(PING_PERIOD);
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick fires immediately; skip it.
    ping.tick().await;

    loop {
        tokio::select! {
            maybe = out_rx.recv() => {
                let Some(mut frame) = maybe else {
                    // Hub hung up on us.
                    let _ = ws_tx.send(Message::Close(None)).await;
                    return;
                };
                // Batch whatever else is queued into the same frame.
                while let Ok(next) = out_rx.try_recv() {
                    frame.push('\n');
                    frame.push_str(&next);
                }
                match timeout(WRITE_WAIT, ws_tx.send(Message::Text(frame))).await {
                    Ok(Ok(())) => {}
                    _ => return,
                }
            }

            _ = ping.tick() => {
                match timeout(WRITE_WAIT, ws_tx.send(Message::Ping(Vec::new()))).await {
                    Ok(Ok(())) => {}
                    _ => return,
                }
            }
        }
    }
}
