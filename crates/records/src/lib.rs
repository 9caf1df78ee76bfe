// SPDX-FileCopyrightText: © 2025 Livereel Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Recording-record collaborator interface.
//!
//! The durable per-session record lives in a database owned by the recording
//! service; this crate exposes only the narrow field updates the pipeline
//! performs. Updates are never full-record overwrites because multiple
//! producers (gateway, worker progress handlers) converge on the same row.

use async_trait::async_trait;
use thiserror::Error;

use livereel_core::{PauseEvent, StreamStats};

pub mod memory;
pub mod sql;

pub use memory::MemoryRecordStore;
pub use sql::SqlRecordStore;

#[derive(Debug, Error)]
pub enum RecordStoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// The fields of a recording row the pipeline reads or writes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Recording {
    pub id: String,
    pub status: String,
    pub is_live_streaming: bool,
    pub stream_started_at_ms: Option<i64>,
    pub stream_ended_at_ms: Option<i64>,
    pub duration: Option<f64>,
    pub pause_count: Option<i64>,
    pub pause_duration_total: Option<f64>,
    pub pause_events: Vec<PauseEvent>,
    pub storage_bucket: Option<String>,
    /// Pre-computed manifest key; set at stream start so players can resolve
    /// playback before the first segment exists.
    pub storage_key: Option<String>,
    pub file_bytes: Option<i64>,
    /// `video` for uploaded files, `hls` for live-streamed sessions.
    pub playback_format: Option<String>,
}

/// Field-scoped updates on the recording record.
#[async_trait]
pub trait RecordingStore: Send + Sync {
    /// Stream went live: status, live flag, storage addressing, start time.
    async fn mark_streaming_started(
        &self,
        id: &str,
        bucket: &str,
        manifest_key: &str,
        started_at_ms: i64,
    ) -> Result<(), RecordStoreError>;

    /// Recorder stopped: duration and pause statistics, end time.
    async fn mark_streaming_stopped(
        &self,
        id: &str,
        stats: &StreamStats,
        ended_at_ms: i64,
    ) -> Result<(), RecordStoreError>;

    /// Transcode outcome: `ready` or `error` (also `processing` mid-flight).
    async fn set_status(&self, id: &str, status: &str) -> Result<(), RecordStoreError>;

    async fn set_file_bytes(&self, id: &str, bytes: u64) -> Result<(), RecordStoreError>;

    /// Clears the live flag. Idempotent; the end time is only written if not
    /// already set.
    async fn clear_live(&self, id: &str, ended_at_ms: i64) -> Result<(), RecordStoreError>;

    async fn get(&self, id: &str) -> Result<Option<Recording>, RecordStoreError>;
}
