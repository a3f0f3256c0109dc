//! Broadcast coordinator.
//!
//! Broadcasts enter either through the admin HTTP endpoint or through the
//! store's `broadcast` pub/sub channel (another instance published one).
//! Either way the broadcast carries a stable id; a small LRU of recently
//! processed ids makes the local echo of a published broadcast, and any
//! pub/sub replay, a no-op.
//!
//! Delivery is two-fold: a frame to every locally connected session
//! (best-effort, non-blocking) and a persisted record for every session the
//! store knows about, so reconnecting clients can retrieve what they missed.

use crate::metrics::AppMetrics;
use crate::registry::{ConnEvent, ConnectionRegistry};
use crate::store::KvStore;
use chat_protocol::{
    BroadcastEnvelope, BroadcastFrame, BroadcastLevel, BroadcastRequest, MessageRecord,
    BROADCAST_CHANNEL,
};
use chrono::Utc;
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{info, warn};

/// Upper bound on the broadcast message body.
pub const MAX_BROADCAST_BYTES: usize = 16 * 1024;

/// Two deliveries of the same content within this window count as one.
const DEDUPE_WINDOW_MS: i64 = 5_000;

/// Whole fan-out (frames + persistence) must finish within this bound;
/// sessions not written by then are skipped and counted as errors.
const FANOUT_DEADLINE: Duration = Duration::from_secs(5);

const RECENT_IDS_CAPACITY: usize = 128;

#[derive(Debug)]
pub enum BroadcastError {
    InvalidMessage(&'static str),
}

impl std::fmt::Display for BroadcastError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BroadcastError::InvalidMessage(reason) => write!(f, "invalid broadcast: {reason}"),
        }
    }
}

impl std::error::Error for BroadcastError {}

/// Stable id for a broadcast: content, title and level plus the timestamp
/// quantized to the dedupe window, hashed.  A retry of the same broadcast
/// within the window maps to the same id.
pub fn stable_broadcast_id(
    message: &str,
    title: &str,
    level: BroadcastLevel,
    timestamp_ms: i64,
) -> String {
    let bucket = timestamp_ms / DEDUPE_WINDOW_MS;
    let mut hasher = Sha256::new();
    hasher.update(message.as_bytes());
    hasher.update(b"|");
    hasher.update(title.as_bytes());
    hasher.update(b"|");
    hasher.update(level.as_str().as_bytes());
    hasher.update(b"|");
    hasher.update(bucket.to_le_bytes());
    hex::encode(hasher.finalize())
}

struct RecentIds {
    order: VecDeque<String>,
    seen: HashSet<String>,
}

impl RecentIds {
    fn new() -> Self {
        RecentIds {
            order: VecDeque::with_capacity(RECENT_IDS_CAPACITY),
            seen: HashSet::with_capacity(RECENT_IDS_CAPACITY),
        }
    }

    /// `true` if the id was not seen before; inserts and evicts the oldest
    /// entry beyond capacity.
    fn insert(&mut self, id: &str) -> bool {
        if self.seen.contains(id) {
            return false;
        }
        if self.order.len() == RECENT_IDS_CAPACITY {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
        self.order.push_back(id.to_owned());
        self.seen.insert(id.to_owned());
        true
    }
}

pub struct Broadcaster {
    store: Arc<dyn KvStore>,
    registry: ConnectionRegistry,
    metrics: Arc<AppMetrics>,
    session_ttl: Duration,
    recent: Mutex<RecentIds>,
}

impl Broadcaster {
    pub fn new(
        store: Arc<dyn KvStore>,
        registry: ConnectionRegistry,
        metrics: Arc<AppMetrics>,
        session_ttl: Duration,
    ) -> Self {
        Broadcaster {
            store,
            registry,
            metrics,
            session_ttl,
            recent: Mutex::new(RecentIds::new()),
        }
    }

    fn mark_seen(&self, id: &str) -> bool {
        self.recent
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(id)
    }

    /// Accept a broadcast request from the admin API: validate, publish to
    /// peer instances, deliver locally.  Returns the number of sessions whose
    /// history gained a record.
    pub async fn broadcast(&self, request: &BroadcastRequest) -> Result<usize, BroadcastError> {
        if request.message.is_empty() {
            return Err(BroadcastError::InvalidMessage("message must not be empty"));
        }
        if request.message.len() > MAX_BROADCAST_BYTES {
            return Err(BroadcastError::InvalidMessage("message exceeds 16 KiB"));
        }

        let timestamp_ms = Utc::now().timestamp_millis();
        let envelope = BroadcastEnvelope {
            id: stable_broadcast_id(&request.message, &request.title, request.level, timestamp_ms),
            message: request.message.clone(),
            title: request.title.clone(),
            level: request.level,
            timestamp_ms,
        };

        if !self.mark_seen(&envelope.id) {
            // Same broadcast already processed within the window.
            return Ok(0);
        }

        match serde_json::to_string(&envelope) {
            Ok(json) => {
                if let Err(e) = self.store.publish(BROADCAST_CHANNEL, &json).await {
                    self.metrics.errors_total.inc();
                    warn!(error = %e, "failed to publish broadcast to peers");
                }
            }
            Err(e) => warn!(error = %e, "failed to encode broadcast envelope"),
        }

        Ok(self.deliver(&envelope).await)
    }

    /// Fan a broadcast out to local connections and persist a record for
    /// every known session.
    async fn deliver(&self, envelope: &BroadcastEnvelope) -> usize {
        let deadline = Instant::now() + FANOUT_DEADLINE;
        let frame = BroadcastFrame::from(envelope);

        let snapshot = self.registry.snapshot().await;
        let mut targets: BTreeSet<String> =
            snapshot.iter().map(|(id, _)| id.clone()).collect();
        match self.store.list_session_ids().await {
            Ok(ids) => targets.extend(ids),
            Err(e) => {
                self.metrics.errors_total.inc();
                warn!(error = %e, "listing sessions failed, broadcasting to live connections only");
            }
        }

        for (_, handle) in &snapshot {
            handle.send(ConnEvent::Broadcast(frame.clone()));
        }

        let mut updated = 0usize;
        let mut remaining = targets.len();
        for session_id in &targets {
            if Instant::now() >= deadline {
                self.metrics.errors_total.inc_by(remaining as u64);
                warn!(
                    skipped = remaining,
                    "broadcast persistence deadline exceeded, skipping remaining sessions"
                );
                break;
            }
            remaining -= 1;

            if self.already_persisted(session_id, envelope).await {
                continue;
            }
            let record = MessageRecord {
                content: envelope.message.clone(),
                timestamp_ms: envelope.timestamp_ms,
                is_sent: false,
                session_id: session_id.clone(),
                is_broadcast: Some(true),
                broadcast_level: Some(envelope.level),
            };
            match self
                .store
                .messages_append(session_id, &record, self.session_ttl)
                .await
            {
                Ok(()) => updated += 1,
                Err(e) => {
                    self.metrics.errors_total.inc();
                    warn!(session_id = %session_id, error = %e, "broadcast persistence failed");
                }
            }
        }

        info!(
            id = %envelope.id,
            connections = snapshot.len(),
            sessions_updated = updated,
            "broadcast delivered"
        );
        updated
    }

    /// Check the tail of a session's history for the same broadcast within
    /// the dedupe window (covers replays that escaped the id LRU).
    async fn already_persisted(&self, session_id: &str, envelope: &BroadcastEnvelope) -> bool {
        match self.store.messages_range(session_id, -4, -1).await {
            Ok(records) => records.iter().any(|r| {
                r.is_broadcast == Some(true)
                    && r.content == envelope.message
                    && r.broadcast_level == Some(envelope.level)
                    && (envelope.timestamp_ms - r.timestamp_ms).abs() <= DEDUPE_WINDOW_MS
            }),
            Err(_) => false,
        }
    }

    /// Long-running subscriber on the store's `broadcast` channel.  Stops at
    /// the first shutdown signal.
    pub fn spawn_subscriber(
        self: Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut rx = match self.store.subscribe(BROADCAST_CHANNEL).await {
                Ok(rx) => rx,
                Err(e) => {
                    self.metrics.errors_total.inc();
                    warn!(error = %e, "broadcast subscription unavailable, cross-instance broadcasts disabled");
                    return;
                }
            };
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    payload = rx.recv() => {
                        match payload {
                            Some(json) => self.handle_published(&json).await,
                            None => break,
                        }
                    }
                }
            }
            info!("broadcast subscriber stopped");
        })
    }

    async fn handle_published(&self, json: &str) {
        match serde_json::from_str::<BroadcastEnvelope>(json) {
            Ok(envelope) => {
                if self.mark_seen(&envelope.id) {
                    self.deliver(&envelope).await;
                }
            }
            Err(e) => {
                self.metrics.errors_total.inc();
                warn!(error = %e, "undecodable broadcast envelope on pub/sub channel");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stable_id_is_stable_within_the_window() {
        let a = stable_broadcast_id("maint", "System Message", BroadcastLevel::Info, 10_000);
        let b = stable_broadcast_id("maint", "System Message", BroadcastLevel::Info, 14_999);
        let c = stable_broadcast_id("maint", "System Message", BroadcastLevel::Info, 15_000);
        assert_eq!(a, b, "same 5s bucket must hash identically");
        assert_ne!(a, c, "next bucket must produce a fresh id");

        let other_level = stable_broadcast_id("maint", "System Message", BroadcastLevel::Error, 10_000);
        assert_ne!(a, other_level);
    }

    #[test]
    fn recent_ids_dedupe_and_evict() {
        let mut recent = RecentIds::new();
        assert!(recent.insert("a"));
        assert!(!recent.insert("a"));

        for i in 0..RECENT_IDS_CAPACITY {
            recent.insert(&format!("fill-{i}"));
        }
        // "a" has been evicted by capacity pressure and counts as new again.
        assert!(recent.insert("a"));
    }
}
