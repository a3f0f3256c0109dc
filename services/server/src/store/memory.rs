//! In-memory [`KvStore`] backend.
//!
//! Single-node semantics: TTLs are enforced lazily (an expired entry is
//! dropped by the next read that touches it) and pub/sub is a per-channel
//! broadcast channel, so "cross-instance" notifications loop back to the
//! local subscribers only.  Used when Redis is unreachable at startup and by
//! the integration tests.

use super::{KvStore, StoreError};
use async_trait::async_trait;
use chat_protocol::{MessageRecord, SessionData};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc};

struct Expiring<T> {
    value: T,
    expires_at: Instant,
}

impl<T> Expiring<T> {
    fn live(&self) -> bool {
        Instant::now() < self.expires_at
    }
}

#[derive(Default)]
struct Inner {
    sessions: HashMap<String, Expiring<SessionData>>,
    lists: HashMap<String, Expiring<Vec<MessageRecord>>>,
    channels: HashMap<String, broadcast::Sender<String>>,
}

pub struct MemoryStore {
    inner: Mutex<Inner>,
    max_history: usize,
}

impl MemoryStore {
    pub fn new(max_history: usize) -> Self {
        MemoryStore {
            inner: Mutex::new(Inner::default()),
            max_history,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // Lock poisoning only happens if a holder panicked; recover the data.
        self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn session_get(&self, id: &str) -> Result<Option<SessionData>, StoreError> {
        let mut inner = self.lock();
        match inner.sessions.get(id) {
            Some(entry) if entry.live() => Ok(Some(entry.value.clone())),
            Some(_) => {
                inner.sessions.remove(id);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn session_put(
        &self,
        id: &str,
        data: &SessionData,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        self.lock().sessions.insert(
            id.to_owned(),
            Expiring {
                value: data.clone(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn session_extend(&self, id: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut inner = self.lock();
        let now = Instant::now();
        let extended = match inner.sessions.get_mut(id) {
            Some(entry) if now < entry.expires_at => {
                entry.expires_at = now + ttl;
                true
            }
            _ => false,
        };
        if extended {
            // The message list shares the session's lifetime.
            if let Some(list) = inner.lists.get_mut(id) {
                list.expires_at = now + ttl;
            }
        } else {
            inner.sessions.remove(id);
        }
        Ok(extended)
    }

    async fn session_ttl(&self, id: &str) -> Result<Option<i64>, StoreError> {
        let mut inner = self.lock();
        match inner.sessions.get(id) {
            Some(entry) if entry.live() => {
                let remaining = entry.expires_at.saturating_duration_since(Instant::now());
                Ok(Some(remaining.as_secs() as i64))
            }
            Some(_) => {
                inner.sessions.remove(id);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn session_delete(&self, id: &str) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner.sessions.remove(id);
        inner.lists.remove(id);
        Ok(())
    }

    async fn messages_append(
        &self,
        id: &str,
        record: &MessageRecord,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let now = Instant::now();
        let entry = inner.lists.entry(id.to_owned()).or_insert_with(|| Expiring {
            value: Vec::new(),
            expires_at: now + ttl,
        });
        if now >= entry.expires_at {
            entry.value.clear();
        }
        entry.value.push(record.clone());
        if entry.value.len() > self.max_history {
            let excess = entry.value.len() - self.max_history;
            entry.value.drain(..excess);
        }
        entry.expires_at = now + ttl;
        Ok(())
    }

    async fn messages_range(
        &self,
        id: &str,
        start: isize,
        stop: isize,
    ) -> Result<Vec<MessageRecord>, StoreError> {
        let mut inner = self.lock();
        if matches!(inner.lists.get(id), Some(entry) if !entry.live()) {
            inner.lists.remove(id);
            return Ok(Vec::new());
        }
        let Some(entry) = inner.lists.get(id) else {
            return Ok(Vec::new());
        };
        let list = &entry.value;
        let len = list.len() as isize;
        let resolve = |index: isize| -> isize {
            if index < 0 {
                (len + index).max(0)
            } else {
                index.min(len)
            }
        };
        let from = resolve(start);
        // List range semantics: the stop index is inclusive.
        let to = resolve(stop).min(len - 1);
        if len == 0 || from > to {
            return Ok(Vec::new());
        }
        Ok(list[from as usize..=to as usize].to_vec())
    }

    async fn list_session_ids(&self) -> Result<Vec<String>, StoreError> {
        let inner = self.lock();
        let mut ids: Vec<String> = inner
            .sessions
            .iter()
            .filter(|(_, entry)| entry.live())
            .map(|(id, _)| id.clone())
            .collect();
        ids.extend(
            inner
                .lists
                .iter()
                .filter(|(_, entry)| entry.live())
                .map(|(id, _)| id.clone()),
        );
        Ok(ids)
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), StoreError> {
        let sender = {
            let inner = self.lock();
            inner.channels.get(channel).cloned()
        };
        if let Some(tx) = sender {
            // No subscribers is not an error, matching Redis PUBLISH.
            let _ = tx.send(payload.to_owned());
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<String>, StoreError> {
        let mut source = {
            let mut inner = self.lock();
            inner
                .channels
                .entry(channel.to_owned())
                .or_insert_with(|| broadcast::channel(64).0)
                .subscribe()
        };
        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            loop {
                match source.recv().await {
                    Ok(payload) => {
                        if tx.send(payload).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Ok(rx)
    }

    async fn ping(&self) -> bool {
        true
    }

    fn backend_kind(&self) -> &'static str {
        "memory"
    }

    fn url(&self) -> &str {
        "memory://local"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(content: &str, session_id: &str) -> MessageRecord {
        MessageRecord {
            content: content.to_owned(),
            timestamp_ms: 1,
            is_sent: true,
            session_id: session_id.to_owned(),
            is_broadcast: None,
            broadcast_level: None,
        }
    }

    fn session(count: u64) -> SessionData {
        SessionData {
            count,
            created_at: 100,
            last_activity: 100,
        }
    }

    #[tokio::test]
    async fn expired_session_reads_as_absent() {
        let store = MemoryStore::new(10);
        store
            .session_put("s1", &session(3), Duration::from_millis(30))
            .await
            .unwrap();
        assert!(store.session_get("s1").await.unwrap().is_some());

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(store.session_get("s1").await.unwrap().is_none());
        assert!(store.session_ttl("s1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn extend_refreshes_session_and_list_lifetime() {
        let store = MemoryStore::new(10);
        store
            .session_put("s1", &session(1), Duration::from_millis(50))
            .await
            .unwrap();
        store
            .messages_append("s1", &record("a", "s1"), Duration::from_millis(50))
            .await
            .unwrap();

        assert!(store.session_extend("s1", Duration::from_secs(60)).await.unwrap());
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(store.session_get("s1").await.unwrap().is_some());
        assert_eq!(store.messages_range("s1", 0, -1).await.unwrap().len(), 1);

        assert!(!store.session_extend("missing", Duration::from_secs(60)).await.unwrap());
    }

    #[tokio::test]
    async fn range_follows_list_index_semantics() {
        let store = MemoryStore::new(10);
        for content in ["a", "b", "c", "d"] {
            store
                .messages_append("s1", &record(content, "s1"), Duration::from_secs(60))
                .await
                .unwrap();
        }

        let all = store.messages_range("s1", 0, -1).await.unwrap();
        assert_eq!(
            all.iter().map(|r| r.content.as_str()).collect::<Vec<_>>(),
            ["a", "b", "c", "d"]
        );

        let tail = store.messages_range("s1", -2, -1).await.unwrap();
        assert_eq!(
            tail.iter().map(|r| r.content.as_str()).collect::<Vec<_>>(),
            ["c", "d"]
        );

        let head = store.messages_range("s1", 0, 1).await.unwrap();
        assert_eq!(
            head.iter().map(|r| r.content.as_str()).collect::<Vec<_>>(),
            ["a", "b"]
        );

        assert!(store.messages_range("missing", 0, -1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn append_trims_to_history_bound() {
        let store = MemoryStore::new(3);
        for i in 0..5 {
            store
                .messages_append("s1", &record(&i.to_string(), "s1"), Duration::from_secs(60))
                .await
                .unwrap();
        }
        let all = store.messages_range("s1", 0, -1).await.unwrap();
        assert_eq!(
            all.iter().map(|r| r.content.as_str()).collect::<Vec<_>>(),
            ["2", "3", "4"]
        );
    }

    #[tokio::test]
    async fn list_session_ids_unions_sessions_and_lists() {
        let store = MemoryStore::new(10);
        store
            .session_put("with-data", &session(1), Duration::from_secs(60))
            .await
            .unwrap();
        store
            .messages_append("with-list", &record("x", "with-list"), Duration::from_secs(60))
            .await
            .unwrap();

        let mut ids = store.list_session_ids().await.unwrap();
        ids.sort();
        ids.dedup();
        assert_eq!(ids, ["with-data", "with-list"]);
    }

    #[tokio::test]
    async fn delete_removes_session_and_messages() {
        let store = MemoryStore::new(10);
        store
            .session_put("s1", &session(1), Duration::from_secs(60))
            .await
            .unwrap();
        store
            .messages_append("s1", &record("x", "s1"), Duration::from_secs(60))
            .await
            .unwrap();

        store.session_delete("s1").await.unwrap();
        assert!(store.session_get("s1").await.unwrap().is_none());
        assert!(store.messages_range("s1", 0, -1).await.unwrap().is_empty());
        assert!(store.list_session_ids().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn publish_reaches_subscribers() {
        let store = MemoryStore::new(10);
        let mut rx = store.subscribe("broadcast").await.unwrap();
        store.publish("broadcast", "payload-1").await.unwrap();

        let payload = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("subscriber should receive within a second")
            .expect("channel should be open");
        assert_eq!(payload, "payload-1");

        // Publishing with no subscriber is a no-op, not an error.
        store.publish("other", "dropped").await.unwrap();
    }
}
