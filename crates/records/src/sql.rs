// SPDX-FileCopyrightText: © 2025 Livereel Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! SQL backend for the recording record.
//!
//! The recordings table is owned by the recording service; this store only
//! issues narrow `UPDATE` statements against the columns the pipeline
//! touches. `ensure_schema` bootstraps a compatible table for development
//! and test databases.

use async_trait::async_trait;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};
use tracing::warn;

use livereel_core::StreamStats;

use crate::{Recording, RecordStoreError, RecordingStore};

/// [`RecordingStore`] backed by a sqlx connection pool.
pub struct SqlRecordStore {
    pool: SqlitePool,
}

impl SqlRecordStore {
    /// Connects to the database at `url` (e.g. `sqlite://livereel.db`).
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be established.
    pub async fn connect(url: &str) -> Result<Self, RecordStoreError> {
        let pool = SqlitePoolOptions::new().max_connections(5).connect(url).await?;
        Ok(Self { pool })
    }

    pub const fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Creates the recordings table if it does not exist. Development and
    /// test convenience; production rows are created by the recording
    /// service before a stream starts.
    ///
    /// # Errors
    ///
    /// Returns an error if the DDL statement fails.
    pub async fn ensure_schema(&self) -> Result<(), RecordStoreError> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS recordings (
                id TEXT PRIMARY KEY,
                status TEXT NOT NULL DEFAULT 'pending',
                is_live_streaming INTEGER NOT NULL DEFAULT 0,
                stream_started_at INTEGER,
                stream_ended_at INTEGER,
                duration REAL,
                pause_count INTEGER,
                pause_duration_total REAL,
                pause_events TEXT,
                storage_bucket TEXT,
                storage_key TEXT,
                file_bytes INTEGER,
                playback_format TEXT
            )
            ",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Inserts a bare row if none exists. Test convenience.
    ///
    /// # Errors
    ///
    /// Returns an error if the insert fails.
    pub async fn ensure_recording(&self, id: &str) -> Result<(), RecordStoreError> {
        sqlx::query("INSERT OR IGNORE INTO recordings (id) VALUES (?)")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    fn warn_if_missing(id: &str, rows_affected: u64, operation: &str) {
        if rows_affected == 0 {
            warn!(recording_id = %id, operation = %operation, "Recording row not found; update skipped");
        }
    }
}

#[async_trait]
impl RecordingStore for SqlRecordStore {
    async fn mark_streaming_started(
        &self,
        id: &str,
        bucket: &str,
        manifest_key: &str,
        started_at_ms: i64,
    ) -> Result<(), RecordStoreError> {
        let result = sqlx::query(
            r"
            UPDATE recordings
            SET status = 'recording',
                is_live_streaming = 1,
                stream_started_at = ?,
                storage_bucket = ?,
                storage_key = ?,
                playback_format = 'hls'
            WHERE id = ?
            ",
        )
        .bind(started_at_ms)
        .bind(bucket)
        .bind(manifest_key)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Self::warn_if_missing(id, result.rows_affected(), "mark_streaming_started");
        Ok(())
    }

    async fn mark_streaming_stopped(
        &self,
        id: &str,
        stats: &StreamStats,
        ended_at_ms: i64,
    ) -> Result<(), RecordStoreError> {
        let pause_events = serde_json::to_string(&stats.pause_events)?;
        let result = sqlx::query(
            r"
            UPDATE recordings
            SET stream_ended_at = ?,
                duration = ?,
                pause_count = ?,
                pause_duration_total = ?,
                pause_events = ?
            WHERE id = ?
            ",
        )
        .bind(ended_at_ms)
        .bind(stats.duration)
        .bind(i64::from(stats.pause_count))
        .bind(stats.pause_duration_total)
        .bind(pause_events)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Self::warn_if_missing(id, result.rows_affected(), "mark_streaming_stopped");
        Ok(())
    }

    async fn set_status(&self, id: &str, status: &str) -> Result<(), RecordStoreError> {
        let result = sqlx::query("UPDATE recordings SET status = ? WHERE id = ?")
            .bind(status)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Self::warn_if_missing(id, result.rows_affected(), "set_status");
        Ok(())
    }

    async fn set_file_bytes(&self, id: &str, bytes: u64) -> Result<(), RecordStoreError> {
        let result = sqlx::query("UPDATE recordings SET file_bytes = ? WHERE id = ?")
            .bind(i64::try_from(bytes).unwrap_or(i64::MAX))
            .bind(id)
            .execute(&self.pool)
            .await?;
        Self::warn_if_missing(id, result.rows_affected(), "set_file_bytes");
        Ok(())
    }

    async fn clear_live(&self, id: &str, ended_at_ms: i64) -> Result<(), RecordStoreError> {
        let result = sqlx::query(
            r"
            UPDATE recordings
            SET is_live_streaming = 0,
                stream_ended_at = COALESCE(stream_ended_at, ?)
            WHERE id = ?
            ",
        )
        .bind(ended_at_ms)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Self::warn_if_missing(id, result.rows_affected(), "clear_live");
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Recording>, RecordStoreError> {
        let row = sqlx::query(
            r"
            SELECT id, status, is_live_streaming, stream_started_at, stream_ended_at,
                   duration, pause_count, pause_duration_total, pause_events,
                   storage_bucket, storage_key, file_bytes, playback_format
            FROM recordings WHERE id = ?
            ",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let pause_events = row
            .try_get::<Option<String>, _>("pause_events")?
            .map(|raw| serde_json::from_str(&raw))
            .transpose()?
            .unwrap_or_default();

        Ok(Some(Recording {
            id: row.try_get("id")?,
            status: row.try_get("status")?,
            is_live_streaming: row.try_get::<i64, _>("is_live_streaming")? != 0,
            stream_started_at_ms: row.try_get("stream_started_at")?,
            stream_ended_at_ms: row.try_get("stream_ended_at")?,
            duration: row.try_get("duration")?,
            pause_count: row.try_get("pause_count")?,
            pause_duration_total: row.try_get("pause_duration_total")?,
            pause_events,
            storage_bucket: row.try_get("storage_bucket")?,
            storage_key: row.try_get("storage_key")?,
            file_bytes: row.try_get("file_bytes")?,
            playback_format: row.try_get("playback_format")?,
        }))
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    async fn test_store() -> SqlRecordStore {
        // One connection: every pooled connection to sqlite::memory: would
        // otherwise see its own database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let store = SqlRecordStore::from_pool(pool);
        store.ensure_schema().await.unwrap();
        store.ensure_recording("s1").await.unwrap();
        store
    }

    #[tokio::test]
    async fn start_stop_lifecycle_updates_narrow_fields() {
        let store = test_store().await;

        store
            .mark_streaming_started("s1", "media", "recordings/2026/08/01/s1/hls/stream.m3u8", 1_000)
            .await
            .unwrap();

        let recording = store.get("s1").await.unwrap().unwrap();
        assert_eq!(recording.status, "recording");
        assert!(recording.is_live_streaming);
        assert_eq!(recording.playback_format.as_deref(), Some("hls"));
        assert!(recording.storage_key.unwrap().ends_with("hls/stream.m3u8"));

        let stats = StreamStats { duration: 40.0, ..StreamStats::default() };
        store.mark_streaming_stopped("s1", &stats, 41_000).await.unwrap();
        store.set_status("s1", "ready").await.unwrap();
        store.set_file_bytes("s1", 2_500_000).await.unwrap();
        store.clear_live("s1", 41_500).await.unwrap();

        let recording = store.get("s1").await.unwrap().unwrap();
        assert_eq!(recording.status, "ready");
        assert!(!recording.is_live_streaming);
        assert_eq!(recording.duration, Some(40.0));
        assert_eq!(recording.file_bytes, Some(2_500_000));
        // clear_live must not clobber the recorder-supplied end time
        assert_eq!(recording.stream_ended_at_ms, Some(41_000));
    }

    #[tokio::test]
    async fn updates_against_missing_rows_are_tolerated() {
        let store = test_store().await;
        store.set_status("ghost", "ready").await.unwrap();
        assert!(store.get("ghost").await.unwrap().is_none());
    }
}
