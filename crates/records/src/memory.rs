// SPDX-FileCopyrightText: © 2025 Livereel Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! In-memory recording store for tests. Rows are created on first touch.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use livereel_core::StreamStats;

use crate::{Recording, RecordStoreError, RecordingStore};

#[derive(Default)]
pub struct MemoryRecordStore {
    rows: Mutex<HashMap<String, Recording>>,
}

impl MemoryRecordStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn with_row<R>(&self, id: &str, update: impl FnOnce(&mut Recording) -> R) -> R {
        #[allow(clippy::unwrap_used)] // no panics happen while the lock is held
        let mut rows = self.rows.lock().unwrap();
        let row = rows.entry(id.to_string()).or_insert_with(|| Recording {
            id: id.to_string(),
            status: "pending".to_string(),
            ..Recording::default()
        });
        update(row)
    }
}

#[async_trait]
impl RecordingStore for MemoryRecordStore {
    async fn mark_streaming_started(
        &self,
        id: &str,
        bucket: &str,
        manifest_key: &str,
        started_at_ms: i64,
    ) -> Result<(), RecordStoreError> {
        self.with_row(id, |row| {
            row.status = "recording".to_string();
            row.is_live_streaming = true;
            row.stream_started_at_ms = Some(started_at_ms);
            row.storage_bucket = Some(bucket.to_string());
            row.storage_key = Some(manifest_key.to_string());
            row.playback_format = Some("hls".to_string());
        });
        Ok(())
    }

    async fn mark_streaming_stopped(
        &self,
        id: &str,
        stats: &StreamStats,
        ended_at_ms: i64,
    ) -> Result<(), RecordStoreError> {
        self.with_row(id, |row| {
            row.stream_ended_at_ms = Some(ended_at_ms);
            row.duration = Some(stats.duration);
            row.pause_count = Some(i64::from(stats.pause_count));
            row.pause_duration_total = Some(stats.pause_duration_total);
            row.pause_events = stats.pause_events.clone();
        });
        Ok(())
    }

    async fn set_status(&self, id: &str, status: &str) -> Result<(), RecordStoreError> {
        self.with_row(id, |row| row.status = status.to_string());
        Ok(())
    }

    async fn set_file_bytes(&self, id: &str, bytes: u64) -> Result<(), RecordStoreError> {
        self.with_row(id, |row| {
            row.file_bytes = Some(i64::try_from(bytes).unwrap_or(i64::MAX));
        });
        Ok(())
    }

    async fn clear_live(&self, id: &str, ended_at_ms: i64) -> Result<(), RecordStoreError> {
        self.with_row(id, |row| {
            row.is_live_streaming = false;
            if row.stream_ended_at_ms.is_none() {
                row.stream_ended_at_ms = Some(ended_at_ms);
            }
        });
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Recording>, RecordStoreError> {
        #[allow(clippy::unwrap_used)] // no panics happen while the lock is held
        let rows = self.rows.lock().unwrap();
        Ok(rows.get(id).cloned())
    }
}
