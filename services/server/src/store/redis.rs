//! Redis-backed [`KvStore`].
//!
//! Session JSON and message-list entries are stored under the normative key
//! names with `EXPIRE`-based TTLs; `RPUSH`/`LTRIM`/`LRANGE` back the message
//! history and a dedicated pub/sub connection pumps channel payloads into an
//! in-process queue.  Every call is bounded by [`STORE_CALL_DEADLINE`] and
//! maps failures to [`StoreError::Unavailable`].
//!
//! The channel store and the message store may be configured as different
//! servers; when the URLs match a single client backs both.

use super::{KvStore, StoreError, STORE_CALL_DEADLINE};
use async_trait::async_trait;
use chat_protocol::{messages_key, session_key, MessageRecord, SessionData, MESSAGES_KEY_SUFFIX};
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::warn;

pub struct RedisStore {
    data: ConnectionManager,
    publish: ConnectionManager,
    pubsub_client: redis::Client,
    url: String,
    max_history: usize,
}

async fn with_deadline<T>(
    fut: impl Future<Output = redis::RedisResult<T>>,
) -> Result<T, StoreError> {
    match tokio::time::timeout(STORE_CALL_DEADLINE, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(StoreError::Unavailable(e.to_string())),
        Err(_) => Err(StoreError::Unavailable("call deadline exceeded".to_owned())),
    }
}

fn ttl_secs(ttl: Duration) -> i64 {
    ttl.as_secs().max(1) as i64
}

/// `session:{id}` or `session:{id}:messages` -> `id`.
fn strip_session_id(key: &str) -> Option<&str> {
    let rest = key.strip_prefix("session:")?;
    let id = rest.strip_suffix(MESSAGES_KEY_SUFFIX).unwrap_or(rest);
    if id.is_empty() {
        None
    } else {
        Some(id)
    }
}

impl RedisStore {
    /// Connect both stores; fails if either server is unreachable.
    pub async fn connect(
        message_url: &str,
        channel_url: &str,
        max_history: usize,
    ) -> Result<Self, StoreError> {
        let data_client =
            redis::Client::open(message_url).map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let data = with_deadline(data_client.get_connection_manager()).await?;

        let (publish, pubsub_client) = if channel_url == message_url {
            (data.clone(), data_client)
        } else {
            let channel_client = redis::Client::open(channel_url)
                .map_err(|e| StoreError::Unavailable(e.to_string()))?;
            let publish = with_deadline(channel_client.get_connection_manager()).await?;
            (publish, channel_client)
        };

        Ok(RedisStore {
            data,
            publish,
            pubsub_client,
            url: message_url.to_owned(),
            max_history,
        })
    }
}

#[async_trait]
impl KvStore for RedisStore {
    async fn session_get(&self, id: &str) -> Result<Option<SessionData>, StoreError> {
        let mut conn = self.data.clone();
        let raw: Option<String> = with_deadline(conn.get(session_key(id))).await?;
        match raw {
            None => Ok(None),
            Some(json) => serde_json::from_str(&json)
                .map(Some)
                .map_err(|e| StoreError::Encoding(e.to_string())),
        }
    }

    async fn session_put(
        &self,
        id: &str,
        data: &SessionData,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let json = serde_json::to_string(data).map_err(|e| StoreError::Encoding(e.to_string()))?;
        let mut conn = self.data.clone();
        with_deadline(conn.set_ex(session_key(id), json, ttl.as_secs().max(1))).await
    }

    async fn session_extend(&self, id: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut conn = self.data.clone();
        let extended: bool =
            with_deadline(conn.expire(session_key(id), ttl_secs(ttl))).await?;
        if extended {
            // The message list shares the session's lifetime; absence is fine.
            let _: bool = with_deadline(conn.expire(messages_key(id), ttl_secs(ttl))).await?;
        }
        Ok(extended)
    }

    async fn session_ttl(&self, id: &str) -> Result<Option<i64>, StoreError> {
        let mut conn = self.data.clone();
        let remaining: i64 = with_deadline(conn.ttl(session_key(id))).await?;
        // -2 = key absent, -1 = present without expiry.
        if remaining == -2 {
            Ok(None)
        } else {
            Ok(Some(remaining))
        }
    }

    async fn session_delete(&self, id: &str) -> Result<(), StoreError> {
        let mut conn = self.data.clone();
        with_deadline(conn.del(vec![session_key(id), messages_key(id)])).await
    }

    async fn messages_append(
        &self,
        id: &str,
        record: &MessageRecord,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let payload =
            serde_json::to_string(record).map_err(|e| StoreError::Encoding(e.to_string()))?;
        let key = messages_key(id);
        let mut conn = self.data.clone();
        let mut pipe = redis::pipe();
        pipe.rpush(&key, payload)
            .ignore()
            .ltrim(&key, -(self.max_history as isize), -1)
            .ignore()
            .expire(&key, ttl_secs(ttl))
            .ignore();
        let _: () = with_deadline(pipe.query_async(&mut conn)).await?;
        Ok(())
    }

    async fn messages_range(
        &self,
        id: &str,
        start: isize,
        stop: isize,
    ) -> Result<Vec<MessageRecord>, StoreError> {
        let mut conn = self.data.clone();
        let raw: Vec<String> =
            with_deadline(conn.lrange(messages_key(id), start, stop)).await?;
        let mut records = Vec::with_capacity(raw.len());
        for json in raw {
            match serde_json::from_str::<MessageRecord>(&json) {
                Ok(record) => records.push(record),
                // A malformed entry must not make the whole history unreadable.
                Err(e) => warn!(session_id = %id, error = %e, "skipping undecodable message record"),
            }
        }
        Ok(records)
    }

    async fn list_session_ids(&self) -> Result<Vec<String>, StoreError> {
        let mut conn = self.data.clone();
        let keys: Vec<String> = with_deadline(conn.keys("session:*")).await?;
        Ok(keys
            .iter()
            .filter_map(|key| strip_session_id(key))
            .map(ToOwned::to_owned)
            .collect())
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), StoreError> {
        let mut conn = self.publish.clone();
        with_deadline(conn.publish(channel, payload)).await
    }

    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<String>, StoreError> {
        let mut pubsub = with_deadline(self.pubsub_client.get_async_pubsub()).await?;
        with_deadline(pubsub.subscribe(channel)).await?;

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            let mut stream = pubsub.into_on_message();
            while let Some(msg) = stream.next().await {
                match msg.get_payload::<String>() {
                    Ok(payload) => {
                        if tx.send(payload).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "dropping non-text pub/sub payload");
                    }
                }
            }
        });
        Ok(rx)
    }

    async fn ping(&self) -> bool {
        let mut conn = self.data.clone();
        let pong: Result<String, StoreError> =
            with_deadline(redis::cmd("PING").query_async(&mut conn)).await;
        pong.is_ok()
    }

    fn backend_kind(&self) -> &'static str {
        "redis"
    }

    fn url(&self) -> &str {
        &self.url
    }
}
