//! Business handler for inbound channel messages.
//!
//! Seeded with the two client-to-server message types. A `build_request`
//! is acknowledged with `build_queued` *before* the job task is spawned, so
//! the acknowledgement always precedes the job's log and status events on
//! the connection. A `secret_request` is answered inline. Everything else
//! gets an `error` envelope referencing the offending request.

use crate::conn::ConnectionHandle;
use crate::hub::MessageHandler;
use crate::registry::JobRegistry;
use async_trait::async_trait;
use kiln_core::protocol::{
    BuildQueuedPayload, BuildRequestPayload, EventType, Message, SecretRequestPayload,
    SecretResponsePayload,
};
use kiln_core::secrets::SecretProvider;
use kiln_core::{BuildNotifier, BuildService};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

pub struct BuildHandler {
    service: Arc<BuildService>,
    registry: Arc<JobRegistry>,
    secrets: Arc<dyn SecretProvider>,
}

impl BuildHandler {
    pub fn new(service: Arc<BuildService>, registry: Arc<JobRegistry>) -> Self {
        let secrets = service.secret_provider();
        Self { service, registry, secrets }
    }

    async fn handle_build_request(&self, message: &Message, conn: &ConnectionHandle) {
        let payload: BuildRequestPayload = match message.decode_payload() {
            Ok(payload) => payload,
            Err(e) => {
                conn.send(Message::error(
                    message.request_id.clone(),
                    "Invalid build request payload",
                    &e,
                ));
                return;
            }
        };
        if payload.build_spec_yaml.is_empty() {
            conn.send(Message::error(
                message.request_id.clone(),
                "Invalid build request payload",
                "build spec cannot be empty",
            ));
            return;
        }

        let build_id = format!("build-{}", Uuid::new_v4());
        info!(build_id = %build_id, conn = %conn.id, "Build request accepted");

        // Acknowledge first: the reply must precede every event of the job
        // on this connection. It shares the job's ordered send queue.
        let ack = Message::with_payload(
            EventType::BuildQueued,
            message.request_id.clone(),
            &BuildQueuedPayload {
                build_id: build_id.clone(),
                message: "Build job accepted".to_string(),
            },
        );
        match ack {
            Ok(ack) => conn.send(ack),
            Err(e) => {
                warn!(build_id = %build_id, error = %e, "Failed to encode build_queued");
            }
        }

        let cancel = CancellationToken::new();
        self.registry.register(&build_id, conn.clone(), cancel.clone());

        let service = self.service.clone();
        let notifier: Arc<dyn BuildNotifier> = self.registry.clone();
        tokio::spawn(async move {
            service.run_job(build_id, payload.build_spec_yaml, notifier, cancel).await;
        });
    }

    async fn handle_secret_request(&self, message: &Message, conn: &ConnectionHandle) {
        let payload: SecretRequestPayload = match message.decode_payload() {
            Ok(payload) => payload,
            Err(e) => {
                conn.send(Message::error(
                    message.request_id.clone(),
                    "Invalid secret request payload",
                    &e,
                ));
                return;
            }
        };
        if payload.source.is_empty() {
            conn.send(Message::error(
                message.request_id.clone(),
                "Invalid secret request payload",
                "secret source cannot be empty",
            ));
            return;
        }

        let timeout = self.service.config().secret_timeout();
        let lookup = tokio::time::timeout(timeout, self.secrets.get_secret(&payload.source)).await;
        match lookup {
            Ok(Ok(value)) => {
                let response = Message::with_payload(
                    EventType::SecretResponse,
                    message.request_id.clone(),
                    &SecretResponsePayload { source: payload.source, value },
                );
                match response {
                    Ok(response) => conn.send(response),
                    Err(e) => warn!(error = %e, "Failed to encode secret response"),
                }
            }
            Ok(Err(e)) => {
                conn.send(Message::error(
                    message.request_id.clone(),
                    "Failed to fetch secret",
                    &e.to_string(),
                ));
            }
            Err(_) => {
                conn.send(Message::error(
                    message.request_id.clone(),
                    "Failed to fetch secret",
                    &format!("secret fetch '{}' timed out", payload.source),
                ));
            }
        }
    }
}

#[async_trait]
impl MessageHandler for BuildHandler {
    async fn handle(&self, message: Message, conn: &ConnectionHandle) {
        match message.event {
            EventType::BuildRequest => self.handle_build_request(&message, conn).await,
            EventType::SecretRequest => self.handle_secret_request(&message, conn).await,
            // Envelope-level keepalive, for clients on transports without
            // native ping frames.
            EventType::Ping => {
                conn.send(Message::new(EventType::Pong, message.request_id.clone()));
            }
            other => {
                conn.send(Message::error(
                    message.request_id.clone(),
                    "Unhandled message type",
                    &format!("type '{:?}' is not accepted by the server", other),
                ));
            }
        }
    }

    async fn on_disconnect(&self, conn_id: Uuid) {
        self.registry.unregister_connection(conn_id);
    }
}
