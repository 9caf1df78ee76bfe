// SPDX-FileCopyrightText: © 2025 Livereel Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! api: Defines the wire contracts for the live streaming pipeline.
//!
//! Three surfaces live here:
//!
//! - The recorder/viewer websocket protocol ([`ClientFrame`], [`ServerFrame`]).
//!   Text frames are UTF-8 JSON objects tagged on a `type` field; binary
//!   frames carry opaque media bytes and have no JSON representation.
//! - The coordination payloads carried through the broker: [`ControlEvent`]
//!   on the shared control log and [`ProgressEvent`] on per-stream channels.
//! - The REST fallback envelopes ([`Document`], [`ErrorEnvelope`]).

use serde::{Deserialize, Serialize};

use livereel_core::{StreamStats, StreamStatus};
pub use livereel_core::types::TranscodeStatus;

pub mod rest;

pub use rest::{Document, ErrorEnvelope, Resource};

// --- Recorder transport ---

/// Client-to-server control frames.
///
/// The first frame on every connection must be `start`; a binary frame
/// before `start` is a protocol error. An unknown `type` fails
/// deserialization and is reported as a protocol error too.
///
/// # Example
/// ```json
/// {"type":"start","recordingId":"s1"}
/// ```
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type")]
#[serde(rename_all = "camelCase")]
pub enum ClientFrame {
    /// Authenticate the connection and create the stream.
    #[serde(rename_all = "camelCase")]
    Start {
        /// Externally assigned stream identifier.
        recording_id: String,
    },
    /// End the stream. Statistics are recorder-supplied and optional; a
    /// disconnect without `stop` is equivalent to `stop` with empty stats.
    Stop(StreamStats),
    /// Liveness probe; answered with `pong`.
    Ping {},
}

/// Server-to-client frames: direct acks plus progress events relayed from
/// the per-stream channel to every connected viewer.
///
/// # Example
/// ```json
/// {"type":"started","recordingId":"s1","status":"Live"}
/// ```
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type")]
#[serde(rename_all = "camelCase")]
pub enum ServerFrame {
    /// Ack for `start`.
    #[serde(rename_all = "camelCase")]
    Started { recording_id: String, status: StreamStatus },
    /// Ack for `stop`. Finalization continues in the background.
    #[serde(rename_all = "camelCase")]
    Stopped { recording_id: String, status: StreamStatus },
    /// Ack for `ping`. Timestamp is unix milliseconds.
    Pong { timestamp: i64 },
    /// Protocol or storage failure scoped to this connection.
    Error { detail: String },
    /// A segment upload completed.
    #[serde(rename_all = "camelCase")]
    SegmentReady { stream_id: String, name: String, size: u64 },
    /// A manifest revision upload completed.
    #[serde(rename_all = "camelCase")]
    ManifestUpdated { stream_id: String, key: String },
    /// The transcode finished; counts cover the final manifest.
    #[serde(rename_all = "camelCase")]
    StreamComplete { stream_id: String, segment_count: u64, total_bytes: u64 },
    /// Transcode status transition.
    #[serde(rename_all = "camelCase")]
    StatusChange { stream_id: String, status: TranscodeStatus },
    /// The transcode failed terminally.
    #[serde(rename_all = "camelCase")]
    StreamError { stream_id: String, reason: String },
}

// --- Coordination payloads ---

/// A record on the single shared control log. Totally ordered by the broker.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlEvent {
    StreamStart {
        stream_id: String,
        bucket: String,
        prefix: String,
    },
    StreamStop {
        stream_id: String,
        stats: StreamStats,
    },
}

/// A record published on a stream's `events:{stream}` channel.
///
/// Delivery is best-effort; every event is self-describing so consumers do
/// not rely on cross-channel ordering.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    SegmentReady { name: String, size: u64 },
    ManifestUpdated { key: String },
    StatusChange { status: TranscodeStatus },
    StreamComplete { segment_count: u64, total_bytes: u64 },
    StreamError { reason: String },
}

impl ProgressEvent {
    /// Converts the channel payload into the broadcast frame viewers see,
    /// attaching the stream id the channel name carried.
    pub fn into_server_frame(self, stream_id: &str) -> ServerFrame {
        let stream_id = stream_id.to_string();
        match self {
            Self::SegmentReady { name, size } => ServerFrame::SegmentReady { stream_id, name, size },
            Self::ManifestUpdated { key } => ServerFrame::ManifestUpdated { stream_id, key },
            Self::StatusChange { status } => ServerFrame::StatusChange { stream_id, status },
            Self::StreamComplete { segment_count, total_bytes } => {
                ServerFrame::StreamComplete { stream_id, segment_count, total_bytes }
            }
            Self::StreamError { reason } => ServerFrame::StreamError { stream_id, reason },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn start_frame_parses_literal_wire_form() {
        let frame: ClientFrame = serde_json::from_str(r#"{"type":"start","recordingId":"s1"}"#)
            .unwrap();
        assert_eq!(frame, ClientFrame::Start { recording_id: "s1".to_string() });
    }

    #[test]
    fn stop_frame_parses_with_full_stats() {
        let frame: ClientFrame = serde_json::from_str(
            r#"{"type":"stop","duration":40,"pauseCount":1,"pauseDurationTotal":2.5,
                "pauseEvents":[{"pausedAt":10,"resumedAt":12.5,"duration":2.5}]}"#,
        )
        .unwrap();
        let ClientFrame::Stop(stats) = frame else {
            panic!("expected stop frame");
        };
        assert_eq!(stats.duration, 40.0);
        assert_eq!(stats.pause_count, 1);
        assert_eq!(stats.pause_events.len(), 1);
        assert_eq!(stats.pause_events[0].resumed_at, 12.5);
    }

    #[test]
    fn stop_frame_accepts_empty_stats() {
        let frame: ClientFrame = serde_json::from_str(r#"{"type":"stop"}"#).unwrap();
        assert_eq!(frame, ClientFrame::Stop(StreamStats::default()));
    }

    #[test]
    fn unknown_frame_type_is_rejected() {
        assert!(serde_json::from_str::<ClientFrame>(r#"{"type":"resume"}"#).is_err());
    }

    #[test]
    fn started_frame_serializes_literal_wire_form() {
        let frame = ServerFrame::Started {
            recording_id: "s1".to_string(),
            status: StreamStatus::Live,
        };
        assert_eq!(
            serde_json::to_value(&frame).unwrap(),
            json!({"type":"started","recordingId":"s1","status":"Live"})
        );
    }

    #[test]
    fn broadcast_frames_use_camel_case_tags() {
        let frame = ServerFrame::SegmentReady {
            stream_id: "s1".to_string(),
            name: "segment_00000.ts".to_string(),
            size: 1024,
        };
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["type"], "segmentReady");
        assert_eq!(value["streamId"], "s1");

        let frame = ServerFrame::StreamComplete {
            stream_id: "s1".to_string(),
            segment_count: 10,
            total_bytes: 2_500_000,
        };
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["type"], "streamComplete");
        assert_eq!(value["segmentCount"], 10);
        assert_eq!(value["totalBytes"], 2_500_000);
    }

    #[test]
    fn progress_event_converts_to_server_frame() {
        let event = ProgressEvent::StatusChange { status: TranscodeStatus::Ready };
        let frame = event.into_server_frame("s1");
        assert_eq!(
            frame,
            ServerFrame::StatusChange {
                stream_id: "s1".to_string(),
                status: TranscodeStatus::Ready
            }
        );
    }

    #[test]
    fn control_event_round_trips() {
        let event = ControlEvent::StreamStart {
            stream_id: "s1".to_string(),
            bucket: "media".to_string(),
            prefix: "recordings/2026/08/01".to_string(),
        };
        let json = serde_json::to_string(&event).unwrap();
        let back: ControlEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }
}
