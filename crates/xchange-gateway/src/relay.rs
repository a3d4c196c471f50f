use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{RwLock, mpsc};
use tracing::debug;
use uuid::Uuid;

use xchange_types::events::RelayEvent;

/// Sending half of one live client connection.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub conn_id: Uuid,
    tx: mpsc::UnboundedSender<RelayEvent>,
}

impl ConnectionHandle {
    /// New handle plus the receiver its connection task drains.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<RelayEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                conn_id: Uuid::new_v4(),
                tx,
            },
            rx,
        )
    }
}

/// Outcome of a publish. None of these are errors for the sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    /// No live connection for the identity.
    Offline,
    /// The mapped connection had already gone away; the mapping was dropped.
    Stale,
}

/// Identity-keyed pub/sub hub. At most one live connection per identity;
/// a newer subscription replaces the older one.
#[derive(Clone, Default)]
pub struct Relay {
    inner: Arc<RelayInner>,
}

#[derive(Default)]
struct RelayInner {
    /// identity_id -> connection
    connections: RwLock<HashMap<String, ConnectionHandle>>,
}

impl Relay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handle` for `identity_id`. Returns the connection id it
    /// replaced, if any.
    pub async fn subscribe(&self, identity_id: &str, handle: ConnectionHandle) -> Option<Uuid> {
        let previous = self
            .inner
            .connections
            .write()
            .await
            .insert(identity_id.to_string(), handle);
        previous.map(|h| h.conn_id)
    }

    /// Create a handle, subscribe it, and hand back (conn_id, receiver).
    pub async fn connect(&self, identity_id: &str) -> (Uuid, mpsc::UnboundedReceiver<RelayEvent>) {
        let (handle, rx) = ConnectionHandle::new();
        let conn_id = handle.conn_id;
        if let Some(old) = self.subscribe(identity_id, handle).await {
            debug!("{} reconnected, replacing connection {}", identity_id, old);
        }
        (conn_id, rx)
    }

    /// Remove the mapping, but only if `conn_id` still owns it.
    pub async fn unsubscribe(&self, identity_id: &str, conn_id: Uuid) -> bool {
        let mut connections = self.inner.connections.write().await;
        match connections.get(identity_id) {
            Some(handle) if handle.conn_id == conn_id => {
                connections.remove(identity_id);
                true
            }
            _ => false,
        }
    }

    /// Push an event to the identity's connection. Never waits on the
    /// client: the channel is unbounded and drained by the connection task.
    pub async fn publish(&self, identity_id: &str, event: RelayEvent) -> Delivery {
        let stale_conn = {
            let connections = self.inner.connections.read().await;
            let Some(handle) = connections.get(identity_id) else {
                return Delivery::Offline;
            };
            match handle.tx.send(event) {
                Ok(()) => return Delivery::Delivered,
                Err(_) => handle.conn_id,
            }
        };

        self.unsubscribe(identity_id, stale_conn).await;
        Delivery::Stale
    }

    pub async fn is_connected(&self, identity_id: &str) -> bool {
        self.inner.connections.read().await.contains_key(identity_id)
    }

    pub async fn connected_count(&self) -> usize {
        self.inner.connections.read().await.len()
    }
}
