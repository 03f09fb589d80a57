//! WebSocket client for the KILN build daemon.
//!
//! Wraps the wire protocol with request/response correlation: replies that
//! echo a `request_id` resolve the matching in-flight request, while
//! streamed events (`log_chunk`, `build_status`) arrive on the event
//! channel in server order.

use futures::{SinkExt, StreamExt};
use kiln_core::protocol::{
    BuildQueuedPayload, BuildRequestPayload, EventType, Message, SecretRequestPayload,
    SecretResponsePayload,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, warn};
use uuid::Uuid;

/// Errors surfaced by the client.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("connection failed: {0}")]
    Connect(String),

    #[error("connection closed")]
    Closed,

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("server error: {message}: {details}")]
    Server { message: String, details: String },

    #[error("encoding error: {0}")]
    Encode(#[from] serde_json::Error),
}

type Pending = Arc<StdMutex<HashMap<String, oneshot::Sender<Message>>>>;

/// A connected build-channel client.
pub struct Client {
    outgoing: mpsc::Sender<Message>,
    events: Mutex<mpsc::Receiver<Message>>,
    pending: Pending,
}

impl Client {
    /// Connect to a daemon (`ws://host:port/ws`).
    pub async fn connect(url: &str) -> Result<Self, ClientError> {
        let (socket, _response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| ClientError::Connect(e.to_string()))?;
        debug!(url = %url, "Connected to build daemon");

        let (mut ws_tx, mut ws_rx) = socket.split();
        let (outgoing, mut outgoing_rx) = mpsc::channel::<Message>(100);
        let (events_tx, events_rx) = mpsc::channel::<Message>(100);
        let pending: Pending = Arc::new(StdMutex::new(HashMap::new()));

        // Writer: drain the outgoing queue onto the socket.
        tokio::spawn(async move {
            while let Some(message) = outgoing_rx.recv().await {
                let json = match serde_json::to_string(&message) {
                    Ok(json) => json,
                    Err(e) => {
                        warn!(error = %e, "Failed to encode outgoing message");
                        continue;
                    }
                };
                if ws_tx.send(WsMessage::Text(json)).await.is_err() {
                    break;
                }
            }
            let _ = ws_tx.send(WsMessage::Close(None)).await;
        });

        // Reader: correlate replies, forward streamed events.
        let reader_pending = pending.clone();
        tokio::spawn(async move {
            while let Some(frame) = ws_rx.next().await {
                let text = match frame {
                    Ok(WsMessage::Text(text)) => text,
                    Ok(WsMessage::Close(_)) | Err(_) => break,
                    Ok(_) => continue,
                };
                let message: Message = match serde_json::from_str(&text) {
                    Ok(message) => message,
                    Err(e) => {
                        warn!(error = %e, "Dropping undecodable message");
                        continue;
                    }
                };

                if let Some(request_id) = &message.request_id {
                    let waiter = {
                        let mut pending =
                            reader_pending.lock().expect("pending map lock poisoned");
                        pending.remove(request_id)
                    };
                    if let Some(waiter) = waiter {
                        let _ = waiter.send(message);
                        continue;
                    }
                }
                if events_tx.send(message).await.is_err() {
                    break;
                }
            }
            // Connection gone: wake every in-flight request with a closed
            // channel.
            reader_pending.lock().expect("pending map lock poisoned").clear();
        });

        Ok(Self { outgoing, events: Mutex::new(events_rx), pending })
    }

    /// Fire-and-forget send.
    pub async fn send(&self, message: Message) -> Result<(), ClientError> {
        self.outgoing.send(message).await.map_err(|_| ClientError::Closed)
    }

    /// Send a request and wait for its correlated reply.
    pub async fn request<P: serde::Serialize>(
        &self,
        event: EventType,
        payload: &P,
        timeout: Duration,
    ) -> Result<Message, ClientError> {
        let request_id = Uuid::new_v4().to_string();
        let message = Message::with_payload(event, Some(request_id.clone()), payload)?;

        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("pending map lock poisoned")
            .insert(request_id.clone(), reply_tx);

        if let Err(e) = self.send(message).await {
            self.pending.lock().expect("pending map lock poisoned").remove(&request_id);
            return Err(e);
        }

        let reply = tokio::time::timeout(timeout, reply_rx).await;
        match reply {
            Ok(Ok(reply)) => {
                if reply.event == EventType::Error || reply.error.is_some() {
                    let details = reply
                        .decode_payload::<kiln_core::protocol::ErrorPayload>()
                        .map(|p| p.details)
                        .unwrap_or_default();
                    return Err(ClientError::Server {
                        message: reply.error.unwrap_or_else(|| "error reply".to_string()),
                        details,
                    });
                }
                Ok(reply)
            }
            Ok(Err(_)) => Err(ClientError::Closed),
            Err(_) => {
                self.pending.lock().expect("pending map lock poisoned").remove(&request_id);
                Err(ClientError::Timeout(timeout))
            }
        }
    }

    /// Submit a build spec; returns the server's acknowledgement with the
    /// assigned build id.
    pub async fn submit_build(
        &self,
        spec_yaml: &str,
        timeout: Duration,
    ) -> Result<BuildQueuedPayload, ClientError> {
        let reply = self
            .request(
                EventType::BuildRequest,
                &BuildRequestPayload { build_spec_yaml: spec_yaml.to_string() },
                timeout,
            )
            .await?;
        reply
            .decode_payload()
            .map_err(|e| ClientError::Server { message: e, details: String::new() })
    }

    /// Resolve a secret through the server's provider.
    pub async fn request_secret(
        &self,
        source: &str,
        timeout: Duration,
    ) -> Result<SecretResponsePayload, ClientError> {
        let reply = self
            .request(
                EventType::SecretRequest,
                &SecretRequestPayload { source: source.to_string() },
                timeout,
            )
            .await?;
        reply
            .decode_payload()
            .map_err(|e| ClientError::Server { message: e, details: String::new() })
    }

    /// Next streamed event (`log_chunk`, `build_status`, uncorrelated
    /// errors), in server order. `None` once the connection is gone.
    pub async fn next_event(&self) -> Option<Message> {
        self.events.lock().await.recv().await
    }

    /// Next streamed event, bounded by a timeout.
    pub async fn next_event_timeout(&self, timeout: Duration) -> Result<Message, ClientError> {
        match tokio::time::timeout(timeout, self.next_event()).await {
            Ok(Some(message)) => Ok(message),
            Ok(None) => Err(ClientError::Closed),
            Err(_) => Err(ClientError::Timeout(timeout)),
        }
    }
}
