//! Websocket broadcast sink
//!
//! Clients authenticate by offering the API secret as a websocket
//! sub-protocol. Accepted connections receive every confirmation and block as
//! JSON until they disconnect or the service shuts down.

use axum::extract::ws::{Message, WebSocket};
use axum::http::HeaderMap;
use futures::{Sink, SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};
use watcher_common::{BlockSummary, ConfirmationEvent, Result};

use super::Notifier;

const SEC_WEBSOCKET_PROTOCOL: &str = "sec-websocket-protocol";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthStatus {
    Accepted,
    Rejected,
}

/// Messages pushed to streaming clients
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum WsMessage {
    Auth(AuthStatus),
    Confirmation(ConfirmationEvent),
    Block(BlockSummary),
}

/// Broadcast hub shared by every open connection
#[derive(Clone)]
pub struct WebSocketHub {
    tx: broadcast::Sender<WsMessage>,
    closed: Arc<watch::Sender<bool>>,
    connections: Arc<AtomicUsize>,
}

impl WebSocketHub {
    pub fn new(channel_capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(channel_capacity);
        let (closed, _) = watch::channel(false);

        Self {
            tx,
            closed: Arc::new(closed),
            connections: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WsMessage> {
        self.tx.subscribe()
    }

    /// Number of authenticated, open connections
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::Relaxed)
    }

    fn broadcast(&self, message: WsMessage) {
        // No listeners is not an error
        let _ = self.tx.send(message);
    }

    /// Serve an authenticated connection until either side closes it
    pub async fn serve(self, socket: WebSocket) {
        let (mut sender, mut receiver) = socket.split();
        let mut messages = self.tx.subscribe();
        let mut closed = self.closed.subscribe();

        let already_closed = *closed.borrow();
        if already_closed {
            let _ = sender.send(Message::Close(None)).await;
            return;
        }

        if send_json(&mut sender, &WsMessage::Auth(AuthStatus::Accepted))
            .await
            .is_err()
        {
            return;
        }

        let open = self.connections.fetch_add(1, Ordering::Relaxed) + 1;
        info!("WebSocket client connected ({} open)", open);

        loop {
            tokio::select! {
                result = messages.recv() => {
                    match result {
                        Ok(message) => {
                            if send_json(&mut sender, &message).await.is_err() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!("WebSocket client lagged, skipped {} messages", n);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
                incoming = receiver.next() => {
                    match incoming {
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Err(e)) => {
                            debug!("WebSocket receive error: {}", e);
                            break;
                        }
                        // Clients have nothing to say; pings are answered by the transport
                        Some(Ok(_)) => {}
                    }
                }
                _ = closed.changed() => {
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                }
            }
        }

        let open = self.connections.fetch_sub(1, Ordering::Relaxed) - 1;
        info!("WebSocket connection closed ({} open)", open);
    }

    /// Tell an unauthenticated client it was rejected, then hang up
    pub async fn reject(mut socket: WebSocket) {
        let _ = send_json(&mut socket, &WsMessage::Auth(AuthStatus::Rejected)).await;
        let _ = socket.send(Message::Close(None)).await;
    }
}

impl Notifier for WebSocketHub {
    fn name(&self) -> &'static str {
        "websocket"
    }

    fn send(&self, event: &ConfirmationEvent) -> Result<()> {
        self.broadcast(WsMessage::Confirmation(event.clone()));
        Ok(())
    }

    fn on_new_block(&self, block: &BlockSummary) -> Result<()> {
        self.broadcast(WsMessage::Block(block.clone()));
        Ok(())
    }

    fn destroy(&self) {
        self.closed.send_replace(true);
    }
}

async fn send_json<S>(sink: &mut S, message: &WsMessage) -> std::result::Result<(), ()>
where
    S: Sink<Message> + Unpin,
{
    let json = serde_json::to_string(message).map_err(|_| ())?;
    sink.send(Message::Text(json.into())).await.map_err(|_| ())
}

/// Sub-protocols offered in the handshake, in order
pub fn offered_protocols(headers: &HeaderMap) -> Vec<String> {
    headers
        .get_all(SEC_WEBSOCKET_PROTOCOL)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .collect()
}
