// SPDX-FileCopyrightText: © 2025 Livereel Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Coordination broker contract for the live streaming pipeline.
//!
//! The pipeline needs four primitives from its coordination plane:
//!
//! - append-only logs with broker-assigned monotone ids and blocking tail
//!   reads (the control log and the per-stream chunk logs);
//! - hash records with field-scoped atomic updates (stream state);
//! - atomic set-if-absent keys with TTL (ownership claims, heartbeats);
//! - channel pub/sub with pattern subscription (progress events).
//!
//! [`Broker`] captures exactly that surface. Two backends exist:
//! [`RedisBroker`](redis::RedisBroker) for production and
//! [`MemoryBroker`](memory::MemoryBroker) for tests.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

pub mod memory;
pub mod redis;

pub use self::memory::MemoryBroker;
pub use self::redis::RedisBroker;

/// Broker-assigned entry id. Opaque to callers; ids from one backend are
/// monotone under that backend's ordering and must not be mixed across
/// backends.
pub type EntryId = String;

/// One record read from an append-only log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub id: EntryId,
    pub payload: String,
}

/// Read position in an append-only log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cursor {
    /// From the first entry.
    Start,
    /// Strictly after a previously observed entry.
    After(EntryId),
}

/// Errors surfaced by broker operations.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker connection failed: {0}")]
    Connection(String),

    #[error("broker command failed: {0}")]
    Command(String),
}

impl From<::redis::RedisError> for BrokerError {
    fn from(err: ::redis::RedisError) -> Self {
        if err.is_connection_refusal() || err.is_connection_dropped() || err.is_timeout() {
            Self::Connection(err.to_string())
        } else {
            Self::Command(err.to_string())
        }
    }
}

/// A live pattern subscription. Messages are `(channel, payload)` pairs;
/// delivery is best-effort and unordered across channels.
pub struct Subscription {
    rx: mpsc::Receiver<(String, String)>,
}

impl Subscription {
    pub(crate) fn new(rx: mpsc::Receiver<(String, String)>) -> Self {
        Self { rx }
    }

    /// Waits for the next message. `None` means the subscription ended.
    pub async fn next(&mut self) -> Option<(String, String)> {
        self.rx.recv().await
    }
}

/// The coordination plane the gateway and the worker depend on.
///
/// All operations are atomic at the granularity of a single call.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Appends a payload to a log and returns the broker-assigned id.
    async fn log_append(&self, log: &str, payload: &str) -> Result<EntryId, BrokerError>;

    /// Reads entries after `cursor`. With a `block` budget the call waits up
    /// to that long for new entries; without one it returns immediately.
    /// An empty result means the budget elapsed (or nothing is buffered).
    async fn log_read(
        &self,
        log: &str,
        cursor: &Cursor,
        block: Option<Duration>,
    ) -> Result<Vec<LogEntry>, BrokerError>;

    /// Id of the last entry currently in the log, if any. Used to resolve a
    /// "new entries only" position before tailing.
    async fn log_last_id(&self, log: &str) -> Result<Option<EntryId>, BrokerError>;

    async fn hash_set(&self, key: &str, fields: &[(String, String)]) -> Result<(), BrokerError>;

    async fn hash_set_field(&self, key: &str, field: &str, value: &str)
        -> Result<(), BrokerError>;

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>, BrokerError>;

    /// Empty map means the record does not exist.
    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, BrokerError>;

    /// Atomic field increment; returns the new value.
    async fn hash_incr(&self, key: &str, field: &str, by: i64) -> Result<i64, BrokerError>;

    /// Atomic set-if-absent. Returns `true` only if the key was absent.
    /// The key auto-expires after `ttl` if one is given and not refreshed.
    async fn set_nx(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, BrokerError>;

    /// Unconditional set (overwrite), with optional TTL.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>)
        -> Result<(), BrokerError>;

    async fn get(&self, key: &str) -> Result<Option<String>, BrokerError>;

    /// Sets a TTL on an existing key, hash, or log. Used to retire terminal
    /// stream state after the retention grace period.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), BrokerError>;

    /// Deletes a key, hash, or log.
    async fn del(&self, key: &str) -> Result<(), BrokerError>;

    /// Keys matching a glob-style pattern. Used only by the reclaim sweep,
    /// which runs once per worker start.
    async fn keys(&self, pattern: &str) -> Result<Vec<String>, BrokerError>;

    /// Fan-out publish. Returns without waiting for receivers.
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), BrokerError>;

    /// Subscribes to every channel matching a glob-style pattern.
    async fn subscribe(&self, pattern: &str) -> Result<Subscription, BrokerError>;
}

/// Glob matcher for `keys` patterns and channel subscriptions.
///
/// Supports `*` (any run of characters); that is the only metacharacter the
/// pipeline's patterns use.
pub(crate) fn glob_match(pattern: &str, candidate: &str) -> bool {
    let mut parts = pattern.split('*');
    let Some(first) = parts.next() else {
        return pattern == candidate;
    };

    let Some(mut rest) = candidate.strip_prefix(first) else {
        return false;
    };

    let mut segments: Vec<&str> = parts.collect();
    let Some(last) = segments.pop() else {
        // No '*' at all: exact match required.
        return rest.is_empty();
    };

    for segment in segments {
        if segment.is_empty() {
            continue;
        }
        match rest.find(segment) {
            Some(pos) => rest = &rest[pos + segment.len()..],
            None => return false,
        }
    }

    rest.ends_with(last)
}
