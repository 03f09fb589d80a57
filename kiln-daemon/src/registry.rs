//! Job registry and notifier.
//!
//! The one piece of process-wide state: a map from `build_id` to the
//! originating connection and the job's cancellation token. The registry
//! doubles as the [`BuildNotifier`] the core build service is handed —
//! log chunks and status events are routed to whichever connection started
//! the job, and a terminal status atomically removes the mapping so nothing
//! can be delivered for that job afterwards.

use crate::conn::ConnectionHandle;
use kiln_core::protocol::{
    BuildStatusPayload, EventType, LogChunkPayload, Message,
};
use kiln_core::{BuildNotifier, BuildPhase, LogStream};
use std::collections::HashMap;
use std::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

struct JobEntry {
    conn: ConnectionHandle,
    cancel: CancellationToken,
}

/// Process-wide build-id -> originating-connection mapping.
#[derive(Default)]
pub struct JobRegistry {
    jobs: RwLock<HashMap<String, JobEntry>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Associate a job with its originating connection.
    pub fn register(&self, build_id: &str, conn: ConnectionHandle, cancel: CancellationToken) {
        let mut jobs = self.jobs.write().expect("job registry lock poisoned");
        jobs.insert(build_id.to_string(), JobEntry { conn, cancel });
        debug!(build_id = %build_id, "Job registered");
    }

    /// Cancel and drop every job originating from a vanished connection.
    pub fn unregister_connection(&self, conn_id: Uuid) {
        let mut jobs = self.jobs.write().expect("job registry lock poisoned");
        let stale: Vec<String> = jobs
            .iter()
            .filter(|(_, entry)| entry.conn.id == conn_id)
            .map(|(id, _)| id.clone())
            .collect();
        for build_id in stale {
            if let Some(entry) = jobs.remove(&build_id) {
                warn!(build_id = %build_id, "Originating connection lost, cancelling job");
                entry.cancel.cancel();
            }
        }
    }

    /// Cancel everything (daemon shutdown).
    pub fn cancel_all(&self) {
        let jobs = self.jobs.read().expect("job registry lock poisoned");
        for entry in jobs.values() {
            entry.cancel.cancel();
        }
    }

    pub fn job_count(&self) -> usize {
        self.jobs.read().expect("job registry lock poisoned").len()
    }
}

impl BuildNotifier for JobRegistry {
    fn notify_log(&self, build_id: &str, stream: LogStream, content: &str) {
        let jobs = self.jobs.read().expect("job registry lock poisoned");
        let Some(entry) = jobs.get(build_id) else {
            // Mapping gone (terminal status sent or client vanished).
            return;
        };
        let payload = LogChunkPayload {
            build_id: build_id.to_string(),
            stream: stream.as_str().to_string(),
            content: content.to_string(),
        };
        match Message::with_payload(EventType::LogChunk, None, &payload) {
            Ok(message) => entry.conn.send(message),
            Err(e) => warn!(build_id = %build_id, error = %e, "Failed to encode log chunk"),
        }
    }

    fn notify_status(
        &self,
        build_id: &str,
        phase: BuildPhase,
        message: Option<&str>,
        artifact_ref: Option<&str>,
        duration_sec: Option<f64>,
    ) {
        let payload = BuildStatusPayload {
            build_id: build_id.to_string(),
            status: phase.as_str().to_string(),
            message: message.map(str::to_string),
            artifact_ref: artifact_ref.map(str::to_string),
            duration_sec,
        };
        let encoded = match Message::with_payload(EventType::BuildStatus, None, &payload) {
            Ok(message) => message,
            Err(e) => {
                warn!(build_id = %build_id, error = %e, "Failed to encode status");
                return;
            }
        };

        if phase.is_terminal() {
            // Remove-then-send under the write lock: once the terminal
            // status is enqueued, no later event can find the mapping.
            let mut jobs = self.jobs.write().expect("job registry lock poisoned");
            if let Some(entry) = jobs.remove(build_id) {
                entry.conn.send(encoded);
                debug!(build_id = %build_id, status = %phase, "Job finished, mapping removed");
            }
        } else {
            let jobs = self.jobs.read().expect("job registry lock poisoned");
            if let Some(entry) = jobs.get(build_id) {
                entry.conn.send(encoded);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle() -> (ConnectionHandle, tokio::sync::mpsc::Receiver<Message>) {
        ConnectionHandle::new(16)
    }

    #[tokio::test]
    async fn test_terminal_status_removes_mapping() {
        let registry = JobRegistry::new();
        let (conn, mut rx) = handle();
        registry.register("b-1", conn, CancellationToken::new());

        registry.notify_log("b-1", LogStream::Stdout, "hello");
        registry.notify_status("b-1", BuildPhase::Success, None, Some("demo:1"), Some(1.0));
        assert_eq!(registry.job_count(), 0);

        // Events after the terminal status are dropped.
        registry.notify_log("b-1", LogStream::Stdout, "late");
        registry.notify_status("b-1", BuildPhase::Failure, None, None, None);

        let first = rx.recv().await.unwrap();
        assert_eq!(first.event, EventType::LogChunk);
        let second = rx.recv().await.unwrap();
        assert_eq!(second.event, EventType::BuildStatus);
        let payload: BuildStatusPayload = second.decode_payload().unwrap();
        assert_eq!(payload.status, "success");
        assert_eq!(payload.artifact_ref.as_deref(), Some("demo:1"));
        // Nothing else was enqueued.
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_disconnect_cancels_jobs() {
        let registry = JobRegistry::new();
        let (conn, _rx) = handle();
        let cancel = CancellationToken::new();
        registry.register("b-2", conn.clone(), cancel.clone());

        registry.unregister_connection(conn.id);
        assert!(cancel.is_cancelled());
        assert_eq!(registry.job_count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_build_is_noop() {
        let registry = JobRegistry::new();
        registry.notify_log("ghost", LogStream::System, "nobody home");
        registry.notify_status("ghost", BuildPhase::Building, None, None, None);
    }
}
