// SPDX-FileCopyrightText: © 2025 Livereel Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Domain types shared by the ingest gateway and the transcode worker.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use time::OffsetDateTime;

/// Current wall-clock time as unix milliseconds, the timestamp unit used
/// throughout the broker records and wire frames.
pub fn unix_ms_now() -> i64 {
    i64::try_from(OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000)
        .unwrap_or(i64::MAX)
}

/// Opaque, externally assigned identifier of a live session.
pub type StreamId = String;

/// Identifier of a transcode worker process.
pub type WorkerId = String;

/// Lifecycle status of a stream, as stored in the broker's state hash.
///
/// A stream exists from the first `start` control event until a bounded grace
/// period after reaching `Complete` or `Error`. Serialized with the variant
/// name as-is (`"Live"`), which is also the wire form in `started` frames.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamStatus {
    Starting,
    Live,
    Ending,
    Complete,
    Error,
}

impl StreamStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "Starting",
            Self::Live => "Live",
            Self::Ending => "Ending",
            Self::Complete => "Complete",
            Self::Error => "Error",
        }
    }

    /// Whether a crashed worker's stream in this status may be reclaimed.
    pub const fn is_reclaimable(self) -> bool {
        matches!(self, Self::Live | Self::Ending)
    }

    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Error)
    }
}

impl fmt::Display for StreamStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StreamStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "starting" => Ok(Self::Starting),
            "live" => Ok(Self::Live),
            "ending" => Ok(Self::Ending),
            "complete" => Ok(Self::Complete),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown stream status: {other}")),
        }
    }
}

/// Transcode outcome published on the progress channel.
///
/// Distinct from [`StreamStatus`]: these are the statuses viewers and the
/// recording record see, not the broker-side lifecycle states.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TranscodeStatus {
    Transcoding,
    Ready,
    Error,
}

impl TranscodeStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Transcoding => "transcoding",
            Self::Ready => "ready",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for TranscodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The per-stream record held in the broker's `state:{stream}` hash.
///
/// Fields are stored as strings and updated with field-scoped atomic
/// operations; `chunk_count` in particular is advanced with an atomic
/// increment, never a read-modify-write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamState {
    pub status: StreamStatus,
    pub owner: Option<WorkerId>,
    pub bucket: String,
    pub prefix: String,
    pub chunk_count: u64,
    /// Unix timestamp in milliseconds.
    pub started_at_ms: i64,
}

impl StreamState {
    pub fn new(bucket: impl Into<String>, prefix: impl Into<String>, started_at_ms: i64) -> Self {
        Self {
            status: StreamStatus::Live,
            owner: None,
            bucket: bucket.into(),
            prefix: prefix.into(),
            chunk_count: 0,
            started_at_ms,
        }
    }

    /// Field list for the initial hash write.
    pub fn to_fields(&self) -> Vec<(String, String)> {
        let mut fields = vec![
            ("status".to_string(), self.status.as_str().to_string()),
            ("bucket".to_string(), self.bucket.clone()),
            ("prefix".to_string(), self.prefix.clone()),
            ("chunk_count".to_string(), self.chunk_count.to_string()),
            ("started_at_ms".to_string(), self.started_at_ms.to_string()),
        ];
        if let Some(owner) = &self.owner {
            fields.push(("owner".to_string(), owner.clone()));
        }
        fields
    }

    /// Reconstructs the record from a hash read. Unknown fields are ignored;
    /// a missing or unparsable `status` field means the record is unusable.
    pub fn from_fields(fields: &HashMap<String, String>) -> Result<Self, String> {
        let status = fields
            .get("status")
            .ok_or_else(|| "state hash missing status field".to_string())?
            .parse::<StreamStatus>()?;

        Ok(Self {
            status,
            owner: fields.get("owner").cloned(),
            bucket: fields.get("bucket").cloned().unwrap_or_default(),
            prefix: fields.get("prefix").cloned().unwrap_or_default(),
            chunk_count: fields
                .get("chunk_count")
                .and_then(|v| v.parse().ok())
                .unwrap_or_default(),
            started_at_ms: fields
                .get("started_at_ms")
                .and_then(|v| v.parse().ok())
                .unwrap_or_default(),
        })
    }
}

/// A committed chunk, as appended to the per-stream chunk log.
///
/// The entry is only appended after the chunk's object write succeeded, so a
/// reader observing sequence `n` can unconditionally fetch `n`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ChunkRecord {
    /// 0-based, strictly increasing per stream, dense.
    pub seq: u64,
    /// Storage key of the immutable chunk object.
    pub key: String,
    /// Byte length.
    pub size: u64,
    /// Unix timestamp in milliseconds.
    pub timestamp: i64,
}

/// One pause interval reported by the recorder on `stop`.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct PauseEvent {
    #[serde(default)]
    pub paused_at: f64,
    #[serde(default)]
    pub resumed_at: f64,
    #[serde(default)]
    pub duration: f64,
}

/// Recorder-supplied session statistics, carried on `StreamStop`.
///
/// A recorder disconnect without a prior `stop` yields the default (empty)
/// statistics.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct StreamStats {
    #[serde(default)]
    pub duration: f64,
    #[serde(default)]
    pub pause_count: u32,
    #[serde(default)]
    pub pause_duration_total: f64,
    #[serde(default)]
    pub pause_events: Vec<PauseEvent>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_str() {
        for status in [
            StreamStatus::Starting,
            StreamStatus::Live,
            StreamStatus::Ending,
            StreamStatus::Complete,
            StreamStatus::Error,
        ] {
            assert_eq!(status.as_str().parse::<StreamStatus>(), Ok(status));
        }
        assert!("bogus".parse::<StreamStatus>().is_err());
    }

    #[test]
    fn state_round_trips_through_fields() {
        let mut state = StreamState::new("media-bucket", "recordings/2026/08/01", 1_754_000_000_000);
        state.chunk_count = 7;
        state.owner = Some("worker-a".to_string());

        let fields: HashMap<String, String> = state.to_fields().into_iter().collect();
        let restored = StreamState::from_fields(&fields).unwrap();
        assert_eq!(restored, state);
    }

    #[test]
    fn state_requires_status_field() {
        let fields = HashMap::from([("bucket".to_string(), "b".to_string())]);
        assert!(StreamState::from_fields(&fields).is_err());
    }

    #[test]
    fn chunk_record_serializes_with_wire_names() {
        let record = ChunkRecord {
            seq: 3,
            key: "recordings/2026/08/01/s1/chunks/chunk_00000003.webm".to_string(),
            size: 256_000,
            timestamp: 1_754_000_000_123,
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["seq"], 3);
        assert_eq!(json["size"], 256_000);
        assert!(json.get("timestamp").is_some());
    }

    #[test]
    fn stats_default_is_empty() {
        let stats: StreamStats = serde_json::from_str("{}").unwrap();
        assert_eq!(stats.pause_count, 0);
        assert!(stats.pause_events.is_empty());
    }
}
