//! Key-value store adapter backing sessions and message history.
//!
//! Two backends implement [`KvStore`]: [`RedisStore`] for the shared
//! external store and [`MemoryStore`] for single-node operation and tests.
//! Key naming is normative and lives in `chat-protocol`:
//! `session:{id}` for session JSON, `session:{id}:messages` for the list.
//!
//! Failure policy: every operation can return [`StoreError::Unavailable`];
//! callers degrade (reads treat it as absent, writes log and count) and the
//! connection layer never surfaces store failures to clients.

pub mod memory;
pub mod redis;

pub use memory::MemoryStore;
pub use redis::RedisStore;

use crate::config::Config;
use async_trait::async_trait;
use chat_protocol::{MessageRecord, SessionData};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Per-call deadline; expiry maps to [`StoreError::Unavailable`].
pub const STORE_CALL_DEADLINE: Duration = Duration::from_secs(2);

#[derive(Debug)]
pub enum StoreError {
    /// The store could not be reached (or the per-call deadline expired).
    Unavailable(String),
    /// A stored value failed to encode or decode.
    Encoding(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Unavailable(s) => write!(f, "store unavailable: {s}"),
            StoreError::Encoding(s) => write!(f, "store encoding error: {s}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// Typed operations over the session/message store.
///
/// Implementations must treat an expired key as absent and must tolerate
/// concurrent scans returning duplicate ids in `list_session_ids`.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Decoded session if present and not expired.
    async fn session_get(&self, id: &str) -> Result<Option<SessionData>, StoreError>;

    /// Write the session JSON and (re)set its TTL.
    async fn session_put(
        &self,
        id: &str,
        data: &SessionData,
        ttl: Duration,
    ) -> Result<(), StoreError>;

    /// Extend the TTL of an existing session.  `false` if the session is absent.
    async fn session_extend(&self, id: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// Remaining TTL in seconds for an existing session, `None` if absent.
    async fn session_ttl(&self, id: &str) -> Result<Option<i64>, StoreError>;

    /// Delete the session and its message list.
    async fn session_delete(&self, id: &str) -> Result<(), StoreError>;

    /// Right-append to the session's message list, trim it to the configured
    /// history bound, and reset the list TTL.
    async fn messages_append(
        &self,
        id: &str,
        record: &MessageRecord,
        ttl: Duration,
    ) -> Result<(), StoreError>;

    /// Slice of the message list; `0` is oldest, `-1` is newest.
    async fn messages_range(
        &self,
        id: &str,
        start: isize,
        stop: isize,
    ) -> Result<Vec<MessageRecord>, StoreError>;

    /// Union of ids with session data and ids with a message list.
    /// May contain duplicates; callers dedupe.
    async fn list_session_ids(&self) -> Result<Vec<String>, StoreError>;

    /// Publish a payload on a pub/sub channel.
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), StoreError>;

    /// Subscribe to a pub/sub channel; payloads arrive on the returned
    /// receiver until the store shuts down.
    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<String>, StoreError>;

    /// `true` if the backing store currently answers.
    async fn ping(&self) -> bool;

    /// Backend name for the status endpoint (`"redis"` or `"memory"`).
    fn backend_kind(&self) -> &'static str;

    /// Store URL as configured (for the status endpoint).
    fn url(&self) -> &str;
}

/// Connect the configured store, falling back to the in-memory backend when
/// Redis is unreachable at startup (degraded single-node mode).
pub async fn connect(config: &Config) -> Arc<dyn KvStore> {
    match RedisStore::connect(
        &config.message_redis_url,
        &config.channel_redis_url,
        config.max_message_history,
    )
    .await
    {
        Ok(store) => {
            info!(url = %config.message_redis_url, "connected to redis store");
            Arc::new(store)
        }
        Err(e) => {
            warn!(
                url = %config.message_redis_url,
                error = %e,
                "redis unreachable, running in single-node mode with the in-memory store"
            );
            Arc::new(MemoryStore::new(config.max_message_history))
        }
    }
}
