//! Per-connection read/write pumps.
//!
//! Each accepted WebSocket runs one reader and one writer task. The reader
//! enforces a 60 s deadline refreshed on every inbound frame, decodes
//! envelopes, and hands them to the hub; the writer drains the bounded send
//! queue and pings the peer at ~90% of the read deadline. Either pump
//! stopping closes the transport and triggers a single disconnect
//! notification.

use crate::hub::Hub;
use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures::{SinkExt, StreamExt};
use kiln_core::protocol::Message;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Maximum quiet time on the read side before the peer is presumed gone.
pub const READ_DEADLINE: Duration = Duration::from_secs(60);

/// Keepalive ping period: ~90% of the read deadline.
pub const PING_PERIOD: Duration = Duration::from_secs(54);

/// Cheap, clonable handle for enqueueing outbound messages on a connection.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub id: Uuid,
    sender: mpsc::Sender<Message>,
}

impl ConnectionHandle {
    pub fn new(queue_size: usize) -> (Self, mpsc::Receiver<Message>) {
        let (sender, receiver) = mpsc::channel(queue_size.max(1));
        (Self { id: Uuid::new_v4(), sender }, receiver)
    }

    /// Enqueue a message. A full queue means the consumer has stalled; the
    /// message is dropped with a warning rather than blocking the producer.
    pub fn send(&self, message: Message) {
        if let Err(e) = self.sender.try_send(message) {
            match e {
                mpsc::error::TrySendError::Full(message) => {
                    warn!(
                        conn = %self.id,
                        event = ?message.event,
                        "Send queue full, dropping message"
                    );
                }
                mpsc::error::TrySendError::Closed(_) => {
                    debug!(conn = %self.id, "Send on closed connection");
                }
            }
        }
    }
}

/// Drive one connection until either pump stops.
pub async fn run_connection(
    socket: WebSocket,
    hub: Arc<Hub>,
    max_message_bytes: usize,
    queue_size: usize,
) {
    let (handle, outbound) = ConnectionHandle::new(queue_size);
    let conn_id = handle.id;
    hub.register(handle.clone()).await;
    debug!(conn = %conn_id, "Client connected");

    let (ws_tx, ws_rx) = socket.split();
    let writer = tokio::spawn(write_pump(ws_tx, outbound));

    read_pump(ws_rx, &handle, &hub, max_message_bytes).await;

    // Reader is done. Unregistering cancels this connection's jobs and
    // drops the registry's queue handles; dropping ours closes the queue,
    // which stops the writer and closes the transport.
    hub.unregister(conn_id).await;
    drop(handle);
    let _ = writer.await;
    debug!(conn = %conn_id, "Client disconnected");
}

async fn write_pump(
    mut ws_tx: futures::stream::SplitSink<WebSocket, WsMessage>,
    mut outbound: mpsc::Receiver<Message>,
) {
    let mut ping = tokio::time::interval(PING_PERIOD);
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ping.tick().await; // first tick fires immediately; skip it

    loop {
        tokio::select! {
            queued = outbound.recv() => {
                let Some(message) = queued else {
                    // Queue closed: say goodbye and drop the transport.
                    let _ = ws_tx.send(WsMessage::Close(None)).await;
                    break;
                };
                let json = match serde_json::to_string(&message) {
                    Ok(json) => json,
                    Err(e) => {
                        warn!(event = ?message.event, error = %e, "Failed to encode message");
                        continue;
                    }
                };
                if let Err(e) = ws_tx.send(WsMessage::Text(json)).await {
                    debug!(error = %e, "Write failed, stopping writer");
                    break;
                }
            }
            _ = ping.tick() => {
                if let Err(e) = ws_tx.send(WsMessage::Ping(Vec::new())).await {
                    debug!(error = %e, "Ping failed, stopping writer");
                    break;
                }
            }
        }
    }
}

async fn read_pump(
    mut ws_rx: futures::stream::SplitStream<WebSocket>,
    handle: &ConnectionHandle,
    hub: &Hub,
    max_message_bytes: usize,
) {
    loop {
        let frame = match tokio::time::timeout(READ_DEADLINE, ws_rx.next()).await {
            Err(_) => {
                warn!(conn = %handle.id, "Read deadline exceeded, closing connection");
                return;
            }
            Ok(None) => return,
            Ok(Some(Err(e))) => {
                debug!(conn = %handle.id, error = %e, "Read error, closing connection");
                return;
            }
            Ok(Some(Ok(frame))) => frame,
        };

        match frame {
            WsMessage::Text(text) => {
                if text.len() > max_message_bytes {
                    handle.send(Message::error(
                        None,
                        "Message too large",
                        &format!("message exceeds the {} byte limit", max_message_bytes),
                    ));
                    continue;
                }
                let message: Message = match serde_json::from_str(&text) {
                    Ok(message) => message,
                    Err(e) => {
                        // Decoding errors answer the sender; the connection
                        // stays open. Recover the request id from the raw
                        // frame when possible so the client can correlate
                        // the rejection.
                        let request_id = serde_json::from_str::<serde_json::Value>(&text)
                            .ok()
                            .and_then(|v| {
                                v.get("request_id").and_then(|id| id.as_str()).map(str::to_string)
                            });
                        handle.send(Message::error(
                            request_id,
                            "Invalid message format",
                            &e.to_string(),
                        ));
                        continue;
                    }
                };
                hub.dispatch(message, handle).await;
            }
            // Pings are answered by the transport layer; pongs and any
            // other control frame just refresh the read deadline by
            // arriving.
            WsMessage::Ping(_) | WsMessage::Pong(_) => {}
            WsMessage::Close(_) => return,
            WsMessage::Binary(_) => {
                handle.send(Message::error(
                    None,
                    "Invalid message format",
                    "binary frames are not part of the protocol",
                ));
            }
        }
    }
}
