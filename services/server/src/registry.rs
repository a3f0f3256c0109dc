//! Process-local registry of active connections, keyed by session id.
//!
//! Each connection owns the receiving half of a bounded broadcast channel;
//! the registry stores the sending half.  Producers (heartbeat publisher,
//! broadcast coordinator, shutdown orchestrator) never block on a slow
//! connection: the channel's lag semantics drop the oldest queued events and
//! the connection task counts the skipped frames as errors.
//!
//! At most one entry exists per session id.  A new connection with an id
//! already present displaces the old entry; the displaced connection is told
//! so and closes itself.  Anonymous connections are never registered.

use chat_protocol::BroadcastFrame;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

/// Outgoing-frame queue depth per connection; producers beyond this displace
/// the oldest queued event.
pub const EVENT_QUEUE_CAPACITY: usize = 64;

/// Events delivered to a connection task from outside its socket.
#[derive(Debug, Clone)]
pub enum ConnEvent {
    /// Periodic heartbeat with a preformatted ISO-8601 timestamp.
    Heartbeat { ts: String },
    /// Administrative broadcast to deliver on the socket.
    Broadcast(BroadcastFrame),
    /// Graceful shutdown: drain and close with code 1001.
    Shutdown,
    /// A newer connection took over this session id; close without draining.
    Replaced,
}

/// Best-effort sink for one connection.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    conn_id: Uuid,
    tx: broadcast::Sender<ConnEvent>,
}

impl ConnectionHandle {
    pub fn new(conn_id: Uuid, tx: broadcast::Sender<ConnEvent>) -> Self {
        ConnectionHandle { conn_id, tx }
    }

    pub fn conn_id(&self) -> Uuid {
        self.conn_id
    }

    /// Enqueue an event; never blocks.  A send to a connection whose receiver
    /// is already gone is a no-op.
    pub fn send(&self, event: ConnEvent) {
        let _ = self.tx.send(event);
    }
}

/// Shared map of session id -> connection handle.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    inner: Arc<RwLock<HashMap<String, ConnectionHandle>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a handle, returning the displaced handle when the session id
    /// was already registered.  The caller notifies the displaced connection.
    pub async fn add(&self, session_id: &str, handle: ConnectionHandle) -> Option<ConnectionHandle> {
        self.inner.write().await.insert(session_id.to_owned(), handle)
    }

    /// Remove the entry for `session_id`, but only if it still belongs to
    /// `conn_id`; a displaced connection must not evict its successor.
    pub async fn remove(&self, session_id: &str, conn_id: Uuid) -> bool {
        let mut map = self.inner.write().await;
        match map.get(session_id) {
            Some(handle) if handle.conn_id == conn_id => {
                map.remove(session_id);
                true
            }
            _ => false,
        }
    }

    pub async fn contains(&self, session_id: &str) -> bool {
        self.inner.read().await.contains_key(session_id)
    }

    /// Point-in-time copy for fan-out.  Iterating the snapshot never holds
    /// the lock, so adders and removers are not blocked by slow deliveries.
    pub async fn snapshot(&self) -> Vec<(String, ConnectionHandle)> {
        self.inner
            .read()
            .await
            .iter()
            .map(|(id, handle)| (id.clone(), handle.clone()))
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }
}
