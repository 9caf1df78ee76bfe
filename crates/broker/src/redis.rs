// SPDX-FileCopyrightText: © 2025 Livereel Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Redis backend for the coordination broker.
//!
//! Mapping onto Redis primitives:
//!
//! - logs are Streams (`XADD` / `XREAD BLOCK` / `XREVRANGE`), one entry per
//!   record with the JSON payload under a single `payload` field;
//! - hashes are Redis hashes (`HSET` / `HINCRBY`);
//! - set-if-absent keys are `SET ... NX PX`;
//! - channels are Redis pub/sub with `PSUBSCRIBE`.
//!
//! Commands run over a [`ConnectionManager`], which reconnects transparently.
//! Subscriptions use a dedicated pub/sub connection.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::streams::{StreamRangeReply, StreamReadReply};
use redis::AsyncCommands;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::{Broker, BrokerError, Cursor, EntryId, LogEntry, Subscription};

/// Maximum entries fetched per log read. Keeps a chunk-consumer catch-up
/// from holding one oversized reply in memory.
const READ_BATCH: usize = 64;

/// [`Broker`] implementation backed by a Redis server.
pub struct RedisBroker {
    client: redis::Client,
    manager: ConnectionManager,
}

impl RedisBroker {
    /// Connects to the broker at `url` (e.g. `redis://127.0.0.1:6379`).
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is malformed or the initial connection
    /// cannot be established.
    pub async fn connect(url: &str) -> Result<Self, BrokerError> {
        let client = redis::Client::open(url)
            .map_err(|e| BrokerError::Connection(format!("invalid broker url: {e}")))?;
        let manager = ConnectionManager::new(client.clone()).await?;
        debug!(url = %url, "Connected to coordination broker");
        Ok(Self { client, manager })
    }

    fn conn(&self) -> ConnectionManager {
        self.manager.clone()
    }

    fn cursor_arg(cursor: &Cursor) -> &str {
        match cursor {
            Cursor::Start => "0",
            Cursor::After(id) => id.as_str(),
        }
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn log_append(&self, log: &str, payload: &str) -> Result<EntryId, BrokerError> {
        let mut conn = self.conn();
        let id: String = conn.xadd(log, "*", &[("payload", payload)]).await?;
        Ok(id)
    }

    async fn log_read(
        &self,
        log: &str,
        cursor: &Cursor,
        block: Option<Duration>,
    ) -> Result<Vec<LogEntry>, BrokerError> {
        let mut cmd = redis::cmd("XREAD");
        cmd.arg("COUNT").arg(READ_BATCH);
        if let Some(budget) = block {
            cmd.arg("BLOCK").arg(u64::try_from(budget.as_millis()).unwrap_or(u64::MAX));
        }
        cmd.arg("STREAMS").arg(log).arg(Self::cursor_arg(cursor));

        let mut conn = self.conn();
        let reply: Option<StreamReadReply> = cmd.query_async(&mut conn).await?;

        let Some(reply) = reply else {
            return Ok(Vec::new());
        };

        let mut entries = Vec::new();
        for key in reply.keys {
            for item in key.ids {
                match item.map.get("payload") {
                    Some(value) => {
                        let payload: String = redis::from_redis_value(value)?;
                        entries.push(LogEntry { id: item.id.clone(), payload });
                    }
                    None => {
                        warn!(log = %log, id = %item.id, "Log entry without payload field; skipping");
                    }
                }
            }
        }
        Ok(entries)
    }

    async fn log_last_id(&self, log: &str) -> Result<Option<EntryId>, BrokerError> {
        let mut conn = self.conn();
        let reply: StreamRangeReply = redis::cmd("XREVRANGE")
            .arg(log)
            .arg("+")
            .arg("-")
            .arg("COUNT")
            .arg(1)
            .query_async(&mut conn)
            .await?;
        Ok(reply.ids.first().map(|entry| entry.id.clone()))
    }

    async fn hash_set(&self, key: &str, fields: &[(String, String)]) -> Result<(), BrokerError> {
        let mut conn = self.conn();
        let () = conn.hset_multiple(key, fields).await?;
        Ok(())
    }

    async fn hash_set_field(
        &self,
        key: &str,
        field: &str,
        value: &str,
    ) -> Result<(), BrokerError> {
        let mut conn = self.conn();
        let () = conn.hset(key, field, value).await?;
        Ok(())
    }

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>, BrokerError> {
        let mut conn = self.conn();
        let value: Option<String> = conn.hget(key, field).await?;
        Ok(value)
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, BrokerError> {
        let mut conn = self.conn();
        let fields: HashMap<String, String> = conn.hgetall(key).await?;
        Ok(fields)
    }

    async fn hash_incr(&self, key: &str, field: &str, by: i64) -> Result<i64, BrokerError> {
        let mut conn = self.conn();
        let value: i64 = conn.hincr(key, field, by).await?;
        Ok(value)
    }

    async fn set_nx(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, BrokerError> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value).arg("NX");
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX));
        }
        let mut conn = self.conn();
        let reply: Option<String> = cmd.query_async(&mut conn).await?;
        Ok(reply.is_some())
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), BrokerError> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX));
        }
        let mut conn = self.conn();
        let () = cmd.query_async(&mut conn).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, BrokerError> {
        let mut conn = self.conn();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), BrokerError> {
        let mut conn = self.conn();
        let () = conn
            .pexpire(key, i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX))
            .await?;
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<(), BrokerError> {
        let mut conn = self.conn();
        let () = conn.del(key).await?;
        Ok(())
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, BrokerError> {
        let mut conn = self.conn();
        let keys: Vec<String> = conn.keys(pattern).await?;
        Ok(keys)
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), BrokerError> {
        let mut conn = self.conn();
        let () = conn.publish(channel, payload).await?;
        Ok(())
    }

    async fn subscribe(&self, pattern: &str) -> Result<Subscription, BrokerError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.psubscribe(pattern).await?;

        let (tx, rx) = mpsc::channel(256);
        let pattern = pattern.to_string();

        tokio::spawn(async move {
            let mut messages = pubsub.on_message();
            while let Some(msg) = messages.next().await {
                let channel = msg.get_channel_name().to_string();
                let payload: String = match msg.get_payload() {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!(channel = %channel, error = %e, "Dropping non-UTF8 pub/sub payload");
                        continue;
                    }
                };
                if tx.send((channel, payload)).await.is_err() {
                    break;
                }
            }
            debug!(pattern = %pattern, "Pub/sub subscription ended");
        });

        Ok(Subscription::new(rx))
    }
}
