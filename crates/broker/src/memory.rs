// SPDX-FileCopyrightText: © 2025 Livereel Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! In-memory broker backend.
//!
//! Implements the full [`Broker`] contract without external services so
//! gateway and worker logic can be tested hermetically: monotone log ids,
//! blocking tail reads, deadline-based TTL expiry, and pattern pub/sub.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc, Notify};
use tokio::time::Instant;

use crate::{glob_match, Broker, BrokerError, Cursor, EntryId, LogEntry, Subscription};

#[derive(Default)]
struct LogState {
    next_id: u64,
    entries: Vec<(u64, String)>,
}

#[derive(Default)]
struct Inner {
    logs: HashMap<String, LogState>,
    hashes: HashMap<String, HashMap<String, String>>,
    keys: HashMap<String, (String, Option<Instant>)>,
    /// TTLs set via `expire` on hashes and logs.
    deadlines: HashMap<String, Instant>,
}

impl Inner {
    fn purge_expired(&mut self) {
        let now = Instant::now();
        let expired: Vec<String> = self
            .deadlines
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(key, _)| key.clone())
            .collect();
        for key in expired {
            self.deadlines.remove(&key);
            self.hashes.remove(&key);
            self.logs.remove(&key);
            self.keys.remove(&key);
        }
    }
}

/// Hermetic [`Broker`] implementation backed by process memory.
pub struct MemoryBroker {
    inner: Mutex<Inner>,
    appended: Notify,
    events: broadcast::Sender<(String, String)>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        let (events, _) = broadcast::channel(1024);
        Self { inner: Mutex::new(Inner::default()), appended: Notify::new(), events }
    }
}

impl MemoryBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        #[allow(clippy::unwrap_used)] // no panics happen while the lock is held
        let mut inner = self.inner.lock().unwrap();
        inner.purge_expired();
        inner
    }

    fn collect_after(log: &LogState, cursor: &Cursor) -> Result<Vec<LogEntry>, BrokerError> {
        let after = match cursor {
            Cursor::Start => None,
            Cursor::After(id) => Some(
                id.parse::<u64>()
                    .map_err(|_| BrokerError::Command(format!("malformed entry id: {id}")))?,
            ),
        };

        Ok(log
            .entries
            .iter()
            .filter(|(id, _)| after.is_none_or(|a| *id > a))
            .map(|(id, payload)| LogEntry { id: id.to_string(), payload: payload.clone() })
            .collect())
    }

    fn key_live(entry: &(String, Option<Instant>)) -> bool {
        entry.1.is_none_or(|deadline| Instant::now() < deadline)
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn log_append(&self, log: &str, payload: &str) -> Result<EntryId, BrokerError> {
        let id = {
            let mut inner = self.lock();
            let state = inner.logs.entry(log.to_string()).or_default();
            state.next_id += 1;
            let id = state.next_id;
            state.entries.push((id, payload.to_string()));
            id
        };
        self.appended.notify_waiters();
        Ok(id.to_string())
    }

    async fn log_read(
        &self,
        log: &str,
        cursor: &Cursor,
        block: Option<Duration>,
    ) -> Result<Vec<LogEntry>, BrokerError> {
        let deadline = block.map(|budget| Instant::now() + budget);

        loop {
            // Register for wakeups before checking, so an append between the
            // check and the wait is not missed.
            let notified = self.appended.notified();

            let entries = {
                let inner = self.lock();
                match inner.logs.get(log) {
                    Some(state) => Self::collect_after(state, cursor)?,
                    None => Vec::new(),
                }
            };

            if !entries.is_empty() {
                return Ok(entries);
            }

            let Some(deadline) = deadline else {
                return Ok(Vec::new());
            };

            tokio::select! {
                () = notified => {}
                () = tokio::time::sleep_until(deadline) => return Ok(Vec::new()),
            }
        }
    }

    async fn log_last_id(&self, log: &str) -> Result<Option<EntryId>, BrokerError> {
        let inner = self.lock();
        Ok(inner
            .logs
            .get(log)
            .and_then(|state| state.entries.last())
            .map(|(id, _)| id.to_string()))
    }

    async fn hash_set(&self, key: &str, fields: &[(String, String)]) -> Result<(), BrokerError> {
        let mut inner = self.lock();
        let hash = inner.hashes.entry(key.to_string()).or_default();
        for (field, value) in fields {
            hash.insert(field.clone(), value.clone());
        }
        Ok(())
    }

    async fn hash_set_field(
        &self,
        key: &str,
        field: &str,
        value: &str,
    ) -> Result<(), BrokerError> {
        self.hash_set(key, &[(field.to_string(), value.to_string())]).await
    }

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>, BrokerError> {
        let inner = self.lock();
        Ok(inner.hashes.get(key).and_then(|hash| hash.get(field).cloned()))
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, BrokerError> {
        let inner = self.lock();
        Ok(inner.hashes.get(key).cloned().unwrap_or_default())
    }

    async fn hash_incr(&self, key: &str, field: &str, by: i64) -> Result<i64, BrokerError> {
        let mut inner = self.lock();
        let hash = inner.hashes.entry(key.to_string()).or_default();
        let current = hash.get(field).and_then(|v| v.parse::<i64>().ok()).unwrap_or(0);
        let next = current + by;
        hash.insert(field.to_string(), next.to_string());
        Ok(next)
    }

    async fn set_nx(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, BrokerError> {
        let mut inner = self.lock();
        let live = inner.keys.get(key).is_some_and(Self::key_live);
        if live {
            return Ok(false);
        }
        let deadline = ttl.map(|t| Instant::now() + t);
        inner.keys.insert(key.to_string(), (value.to_string(), deadline));
        Ok(true)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), BrokerError> {
        let deadline = ttl.map(|t| Instant::now() + t);
        self.lock().keys.insert(key.to_string(), (value.to_string(), deadline));
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, BrokerError> {
        let inner = self.lock();
        Ok(inner
            .keys
            .get(key)
            .filter(|entry| Self::key_live(entry))
            .map(|(value, _)| value.clone()))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), BrokerError> {
        self.lock().deadlines.insert(key.to_string(), Instant::now() + ttl);
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<(), BrokerError> {
        let mut inner = self.lock();
        inner.keys.remove(key);
        inner.hashes.remove(key);
        inner.logs.remove(key);
        inner.deadlines.remove(key);
        Ok(())
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, BrokerError> {
        let inner = self.lock();
        let mut matches: Vec<String> = inner
            .keys
            .iter()
            .filter(|(key, entry)| Self::key_live(entry) && glob_match(pattern, key))
            .map(|(key, _)| key.clone())
            .collect();
        matches.extend(inner.hashes.keys().filter(|key| glob_match(pattern, key)).cloned());
        matches.sort_unstable();
        matches.dedup();
        Ok(matches)
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), BrokerError> {
        // Err means no subscribers, which is fine for best-effort fan-out.
        let _ = self.events.send((channel.to_string(), payload.to_string()));
        Ok(())
    }

    async fn subscribe(&self, pattern: &str) -> Result<Subscription, BrokerError> {
        let mut events_rx = self.events.subscribe();
        let pattern = pattern.to_string();
        let (tx, rx) = mpsc::channel(256);

        tokio::spawn(async move {
            loop {
                match events_rx.recv().await {
                    Ok((channel, payload)) => {
                        if glob_match(&pattern, &channel)
                            && tx.send((channel, payload)).await.is_err()
                        {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Ok(Subscription::new(rx))
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[tokio::test]
    async fn log_ids_are_monotone_and_cursor_advances() {
        let broker = MemoryBroker::new();
        let first = broker.log_append("control", "a").await.unwrap();
        let second = broker.log_append("control", "b").await.unwrap();
        assert!(second > first);

        let all = broker.log_read("control", &Cursor::Start, None).await.unwrap();
        assert_eq!(all.len(), 2);

        let tail = broker
            .log_read("control", &Cursor::After(first), None)
            .await
            .unwrap();
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].payload, "b");
    }

    #[tokio::test]
    async fn blocking_read_wakes_on_append() {
        let broker = MemoryBroker::new();
        let reader = {
            let broker = Arc::clone(&broker);
            tokio::spawn(async move {
                broker
                    .log_read("chunks:s1", &Cursor::Start, Some(Duration::from_secs(5)))
                    .await
                    .unwrap()
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        broker.log_append("chunks:s1", "chunk").await.unwrap();

        let entries = reader.await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].payload, "chunk");
    }

    #[tokio::test]
    async fn blocking_read_times_out_empty() {
        let broker = MemoryBroker::new();
        let entries = broker
            .log_read("chunks:s1", &Cursor::Start, Some(Duration::from_millis(30)))
            .await
            .unwrap();
        assert!(entries.is_empty());
    }

    #[tokio::test]
    async fn set_nx_is_exclusive_until_expiry() {
        let broker = MemoryBroker::new();
        assert!(broker.set_nx("owner:s1", "w1", None).await.unwrap());
        assert!(!broker.set_nx("owner:s1", "w2", None).await.unwrap());
        assert_eq!(broker.get("owner:s1").await.unwrap().as_deref(), Some("w1"));

        assert!(broker
            .set_nx("heartbeat:w1", "1", Some(Duration::from_millis(20)))
            .await
            .unwrap());
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(broker.get("heartbeat:w1").await.unwrap(), None);
        assert!(broker
            .set_nx("heartbeat:w1", "1", Some(Duration::from_millis(20)))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn hash_incr_is_atomic_per_call() {
        let broker = MemoryBroker::new();
        assert_eq!(broker.hash_incr("state:s1", "chunk_count", 1).await.unwrap(), 1);
        assert_eq!(broker.hash_incr("state:s1", "chunk_count", 1).await.unwrap(), 2);
        assert_eq!(
            broker.hash_get("state:s1", "chunk_count").await.unwrap().as_deref(),
            Some("2")
        );
    }

    #[tokio::test]
    async fn subscribe_filters_by_pattern() {
        let broker = MemoryBroker::new();
        let mut sub = broker.subscribe("events:*").await.unwrap();

        broker.publish("events:s1", "one").await.unwrap();
        broker.publish("other:s1", "nope").await.unwrap();
        broker.publish("events:s2", "two").await.unwrap();

        let (channel, payload) = sub.next().await.unwrap();
        assert_eq!((channel.as_str(), payload.as_str()), ("events:s1", "one"));
        let (channel, payload) = sub.next().await.unwrap();
        assert_eq!((channel.as_str(), payload.as_str()), ("events:s2", "two"));
    }

    #[tokio::test]
    async fn expire_retires_hashes_after_grace() {
        let broker = MemoryBroker::new();
        broker.hash_set_field("state:s1", "status", "Complete").await.unwrap();
        broker.expire("state:s1", Duration::from_millis(20)).await.unwrap();
        assert!(!broker.hash_get_all("state:s1").await.unwrap().is_empty());

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(broker.hash_get_all("state:s1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn keys_lists_live_keys_and_hashes() {
        let broker = MemoryBroker::new();
        broker.set("owner:s1", "w1", None).await.unwrap();
        broker.set("owner:s2", "w2", None).await.unwrap();
        broker.set("heartbeat:w1", "1", None).await.unwrap();

        let mut owners = broker.keys("owner:*").await.unwrap();
        owners.sort_unstable();
        assert_eq!(owners, vec!["owner:s1", "owner:s2"]);
    }
}
