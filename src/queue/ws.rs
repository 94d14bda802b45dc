use axum::{
    body::Bytes,
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt, stream::SplitSink, stream::SplitStream};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::models::{PhaseQueueItem, PhaseStatus};
use crate::errors::DeliveryError;

/// How often to send WebSocket Ping frames.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// How long to wait for a Pong response before considering the connection dead.
const PONG_TIMEOUT: Duration = Duration::from_secs(60);

/// Broadcast channel depth; slow clients past this lag and skip messages.
pub const CHANNEL_CAPACITY: usize = 256;

// ── WebSocket message types ──────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum WsMessage {
    QueueUpdated {
        group_id: i64,
        items: Vec<PhaseQueueItem>,
    },
    PhaseCompleted {
        queue_id: String,
        group_id: i64,
        phase_number: u32,
    },
    PhaseFailed {
        queue_id: String,
        group_id: i64,
        phase_number: u32,
        error: Option<String>,
    },
    PhaseBlocked {
        queue_id: String,
        group_id: i64,
        phase_number: u32,
        reason: Option<String>,
    },
    PhasesRemoved {
        group_id: i64,
        queue_ids: Vec<String>,
    },
}

impl WsMessage {
    /// Event for an item that just reached a terminal state.
    pub fn transition(item: &PhaseQueueItem) -> Option<Self> {
        let queue_id = item.queue_id.clone();
        let (group_id, phase_number) = (item.group_id, item.phase_number);
        match item.status {
            PhaseStatus::Completed => Some(Self::PhaseCompleted {
                queue_id,
                group_id,
                phase_number,
            }),
            PhaseStatus::Failed => Some(Self::PhaseFailed {
                queue_id,
                group_id,
                phase_number,
                error: item.error_message.clone(),
            }),
            PhaseStatus::Blocked => Some(Self::PhaseBlocked {
                queue_id,
                group_id,
                phase_number,
                reason: item.error_message.clone(),
            }),
            _ => None,
        }
    }
}

// ── Broadcaster seam ─────────────────────────────────────────────────

/// Fire-and-forget fan-out of queue changes to live viewers.
/// Callers log and swallow any error.
pub trait Broadcaster: Send + Sync {
    fn publish(&self, group_id: i64, items: &[PhaseQueueItem]) -> Result<(), DeliveryError>;

    /// Announce a single terminal transition. Non-terminal items are ignored.
    fn publish_transition(&self, _item: &PhaseQueueItem) -> Result<(), DeliveryError> {
        Ok(())
    }

    fn publish_removed(&self, _group_id: i64, _queue_ids: &[String]) -> Result<(), DeliveryError> {
        Ok(())
    }
}

/// Broadcaster backed by a tokio broadcast channel feeding `/ws` clients.
#[derive(Clone)]
pub struct WsBroadcaster {
    tx: broadcast::Sender<String>,
}

impl WsBroadcaster {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel::<String>(CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn sender(&self) -> broadcast::Sender<String> {
        self.tx.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }

    pub fn send(&self, msg: &WsMessage) -> Result<(), DeliveryError> {
        broadcast_message(&self.tx, msg)
    }
}

impl Default for WsBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl Broadcaster for WsBroadcaster {
    fn publish(&self, group_id: i64, items: &[PhaseQueueItem]) -> Result<(), DeliveryError> {
        self.send(&WsMessage::QueueUpdated {
            group_id,
            items: items.to_vec(),
        })
    }

    fn publish_transition(&self, item: &PhaseQueueItem) -> Result<(), DeliveryError> {
        match WsMessage::transition(item) {
            Some(msg) => self.send(&msg),
            None => Ok(()),
        }
    }

    fn publish_removed(&self, group_id: i64, queue_ids: &[String]) -> Result<(), DeliveryError> {
        self.send(&WsMessage::PhasesRemoved {
            group_id,
            queue_ids: queue_ids.to_vec(),
        })
    }
}

// ── WebSocket handler ────────────────────────────────────────────────

/// WebSocket handler that accepts a broadcast sender directly (for use with server router).
pub async fn ws_handler_with_sender(
    ws: WebSocketUpgrade,
    tx: broadcast::Sender<String>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket_with_sender(socket, tx))
}

async fn handle_socket_with_sender(socket: WebSocket, tx: broadcast::Sender<String>) {
    let (sender, receiver) = socket.split();
    let rx = tx.subscribe();
    run_socket_loop(sender, receiver, rx).await;
}

/// Core WebSocket loop with ping/pong keepalive.
///
/// Combines broadcast forwarding, client message receiving, and periodic
/// ping/pong health checking into a single select loop. If no Pong is
/// received within [`PONG_TIMEOUT`] after a Ping is sent, the connection
/// is considered dead and the loop exits.
async fn run_socket_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut receiver: SplitStream<WebSocket>,
    mut rx: broadcast::Receiver<String>,
) {
    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    // The first tick completes immediately.
    ping_interval.tick().await;

    let mut last_pong = Instant::now();
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            _ = ping_interval.tick() => {
                if awaiting_pong && last_pong.elapsed() > PONG_TIMEOUT {
                    debug!("websocket client missed pong deadline");
                    break;
                }
                if sender.send(Message::Ping(Bytes::new())).await.is_err() {
                    break;
                }
                awaiting_pong = true;
            }

            result = rx.recv() => {
                match result {
                    Ok(msg) => {
                        if sender.send(Message::Text(msg.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "websocket client lagged behind queue updates");
                        continue;
                    }
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Pong(_))) => {
                        last_pong = Instant::now();
                        awaiting_pong = false;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }

    let _ = sender.send(Message::Close(None)).await;
}

// ── Broadcast helper ─────────────────────────────────────────────────

/// Serialize and broadcast a WsMessage to all connected WebSocket clients.
/// Having no connected clients is not an error.
pub fn broadcast_message(
    tx: &broadcast::Sender<String>,
    msg: &WsMessage,
) -> Result<(), DeliveryError> {
    let json = serde_json::to_string(msg).map_err(|e| DeliveryError::Broadcast(e.to_string()))?;
    let _ = tx.send(json);
    Ok(())
}

// ── Tests ────────────────────────────────────────────────────────────
