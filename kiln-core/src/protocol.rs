//! Wire protocol for the KILN build channel.
//!
//! Every frame on the channel is a JSON-encoded [`Message`] envelope. Replies
//! to request/response pairs echo the client-generated `request_id`; streamed
//! events (`log_chunk`, `build_status`) carry no `request_id` and are
//! associated with a job through the embedded `build_id` instead.
//!
//! Keepalive rides the transport's native ping/pong control frames in the
//! daemon; the `Ping`/`Pong` event types exist for framed transports without
//! built-in keepalive.

use serde::{Deserialize, Serialize};

/// Type of a message exchanged over the build channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    // Client -> Server
    BuildRequest,
    SecretRequest,

    // Server -> Client
    BuildQueued,
    LogChunk,
    BuildStatus,
    SecretResponse,
    Error,

    // Transport
    Ping,
    Pong,
}

/// The envelope exchanged over the channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub event: EventType,

    /// Correlates request/response pairs. Generated by the client.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,

    /// Event-specific payload, opaque at the envelope level.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,

    /// Error message when `event == Error` or for a negative reply.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// --- Payloads ---

/// Payload of a `build_request`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildRequestPayload {
    /// The build spec, serialized as YAML. Specs can be large; YAML keeps
    /// them readable in transit and matches the on-disk format.
    pub build_spec_yaml: String,
}

/// Payload of a `build_queued` acknowledgement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildQueuedPayload {
    /// Unique id assigned by the server for this build.
    pub build_id: String,
    pub message: String,
}

/// Payload of a streamed `log_chunk`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogChunkPayload {
    pub build_id: String,
    /// "stdout", "stderr" or "system".
    pub stream: String,
    pub content: String,
}

/// Payload of a `build_status` transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildStatusPayload {
    pub build_id: String,
    /// One of the orchestrator phase names, or the terminal
    /// "success"/"failure".
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Canonical artifact reference on success: a tag, an absolute local
    /// path, or an object-store path depending on the output target.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact_ref: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_sec: Option<f64>,
}

/// Payload of a `secret_request`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretRequestPayload {
    /// Opaque key handed to the secret provider.
    pub source: String,
}

/// Payload of a `secret_response`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretResponsePayload {
    pub source: String,
    pub value: String,
}

/// Payload attached to an `error` envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<i32>,
    pub details: String,
}

// --- Constructors ---

impl Message {
    /// Create a message without a payload.
    pub fn new(event: EventType, request_id: Option<String>) -> Self {
        Self { event, request_id, payload: None, error: None }
    }

    /// Create a message carrying a structured payload.
    pub fn with_payload<P: Serialize>(
        event: EventType,
        request_id: Option<String>,
        payload: &P,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            event,
            request_id,
            payload: Some(serde_json::to_value(payload)?),
            error: None,
        })
    }

    /// Create an error reply tied to the offending request.
    pub fn error(request_id: Option<String>, error: &str, details: &str) -> Self {
        let payload = serde_json::to_value(ErrorPayload {
            code: None,
            details: details.to_string(),
        })
        .ok();
        Self {
            event: EventType::Error,
            request_id,
            payload,
            error: Some(error.to_string()),
        }
    }

    /// Decode the payload into the given structure.
    pub fn decode_payload<P: for<'de> Deserialize<'de>>(&self) -> Result<P, String> {
        let payload = self
            .payload
            .as_ref()
            .ok_or_else(|| format!("message payload is empty for type {:?}", self.event))?;
        serde_json::from_value(payload.clone())
            .map_err(|e| format!("failed to decode payload for type {:?}: {}", self.event, e))
    }
}
