//! Connection hub: registry of active connections and message dispatch.

use crate::conn::ConnectionHandle;
use async_trait::async_trait;
use kiln_core::protocol::Message;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

/// Business handler the hub forwards parsed inbound messages to.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Handle one inbound message. Replies go through the originating
    /// connection's handle; long-running work is spawned, never awaited
    /// here.
    async fn handle(&self, message: Message, conn: &ConnectionHandle);

    /// The connection is gone; drop whatever references it.
    async fn on_disconnect(&self, conn_id: Uuid);
}

/// Maintains the set of active connections and routes messages to the
/// injected business handler.
pub struct Hub {
    connections: RwLock<HashMap<Uuid, ConnectionHandle>>,
    handler: Arc<dyn MessageHandler>,
}

impl Hub {
    pub fn new(handler: Arc<dyn MessageHandler>) -> Self {
        Self { connections: RwLock::new(HashMap::new()), handler }
    }

    pub async fn register(&self, conn: ConnectionHandle) {
        let mut connections = self.connections.write().await;
        connections.insert(conn.id, conn);
        debug!(total = connections.len(), "Connection registered");
    }

    pub async fn unregister(&self, conn_id: Uuid) {
        let removed = {
            let mut connections = self.connections.write().await;
            connections.remove(&conn_id)
        };
        if removed.is_some() {
            debug!(conn = %conn_id, "Connection unregistered");
            self.handler.on_disconnect(conn_id).await;
        }
    }

    pub async fn dispatch(&self, message: Message, conn: &ConnectionHandle) {
        self.handler.handle(message, conn).await;
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }
}
