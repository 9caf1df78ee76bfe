// SPDX-FileCopyrightText: © 2025 Livereel Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Object-key layout and broker key names.
//!
//! The object layout is bit-exact and load-bearing: downstream players fetch
//! the manifest at a pre-computed key, and the chunk-log invariant ties each
//! committed sequence number to exactly one object key.
//!
//! For a stream `S` started on 2026-08-01:
//!
//! ```text
//! recordings/2026/08/01/S/chunks/chunk_00000000.webm
//! recordings/2026/08/01/S/hls/segment_00000.ts
//! recordings/2026/08/01/S/hls/stream.m3u8
//! ```

use regex::Regex;
use std::sync::OnceLock;
use time::{Date, OffsetDateTime};

/// Filename of the rolling playlist inside a stream's `hls/` directory.
pub const MANIFEST_NAME: &str = "stream.m3u8";

/// Name of the single shared control log.
pub const CONTROL_LOG: &str = "control";

/// Date-prefixed root for all of a day's streams: `recordings/{YYYY}/{MM}/{DD}`.
pub fn date_prefix(date: Date) -> String {
    format!(
        "recordings/{:04}/{:02}/{:02}",
        date.year(),
        u8::from(date.month()),
        date.day()
    )
}

/// Date prefix for the current UTC day.
pub fn today_prefix() -> String {
    date_prefix(OffsetDateTime::now_utc().date())
}

/// Storage key of chunk `seq` of a stream: `{prefix}/{stream}/chunks/chunk_{seq:08}.webm`.
pub fn chunk_key(prefix: &str, stream_id: &str, seq: u64) -> String {
    format!("{prefix}/{stream_id}/chunks/chunk_{seq:08}.webm")
}

/// Storage key of a muxer output file: `{prefix}/{stream}/hls/{name}`.
pub fn hls_key(prefix: &str, stream_id: &str, name: &str) -> String {
    format!("{prefix}/{stream_id}/hls/{name}")
}

/// Storage key of a stream's playlist. This is the `storageKey` recorded on
/// the recording record at stream start.
pub fn manifest_key(prefix: &str, stream_id: &str) -> String {
    hls_key(prefix, stream_id, MANIFEST_NAME)
}

/// Path-traversal guard for segment and manifest names served back out.
///
/// Accepts exactly `[\w\-]+` followed by a `.ts` or `.m3u8` extension.
pub fn is_safe_segment_name(name: &str) -> bool {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let pattern = PATTERN.get_or_init(|| {
        #[allow(clippy::unwrap_used)] // pattern is a compile-time literal
        Regex::new(r"^[\w\-]+\.(ts|m3u8)$").unwrap()
    });
    pattern.is_match(name)
}

// --- Broker key names ---

/// Per-stream chunk log: `chunks:{stream}`.
pub fn chunk_log(stream_id: &str) -> String {
    format!("chunks:{stream_id}")
}

/// Per-stream state hash: `state:{stream}`.
pub fn state_key(stream_id: &str) -> String {
    format!("state:{stream_id}")
}

/// Per-stream ownership key: `owner:{stream}`.
pub fn owner_key(stream_id: &str) -> String {
    format!("owner:{stream_id}")
}

/// Pattern matching every ownership key, for the reclaim sweep.
pub const OWNER_PATTERN: &str = "owner:*";

/// Extracts the stream id from an `owner:{stream}` key.
pub fn stream_of_owner_key(key: &str) -> Option<&str> {
    key.strip_prefix("owner:")
}

/// Per-worker liveness key: `heartbeat:{worker}`.
pub fn heartbeat_key(worker_id: &str) -> String {
    format!("heartbeat:{worker_id}")
}

/// Per-stream progress channel: `events:{stream}`.
pub fn events_channel(stream_id: &str) -> String {
    format!("events:{stream_id}")
}

/// Pattern matching every progress channel, for the gateway's subscriber.
pub const EVENTS_PATTERN: &str = "events:*";

/// Extracts the stream id from an `events:{stream}` channel name.
pub fn stream_of_events_channel(channel: &str) -> Option<&str> {
    channel.strip_prefix("events:")
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::Month;

    #[test]
    fn date_prefix_is_zero_padded() {
        let date = Date::from_calendar_date(2026, Month::August, 1).unwrap();
        assert_eq!(date_prefix(date), "recordings/2026/08/01");
    }

    #[test]
    fn chunk_key_pads_sequence_to_eight_digits() {
        assert_eq!(
            chunk_key("recordings/2026/08/01", "s1", 12),
            "recordings/2026/08/01/s1/chunks/chunk_00000012.webm"
        );
    }

    #[test]
    fn manifest_key_ends_with_playlist_name() {
        let key = manifest_key("recordings/2026/08/01", "s1");
        assert!(key.ends_with("hls/stream.m3u8"));
    }

    #[test]
    fn segment_name_guard_rejects_traversal() {
        assert!(is_safe_segment_name("segment_00001.ts"));
        assert!(is_safe_segment_name("stream.m3u8"));
        assert!(is_safe_segment_name("seg-a_1.ts"));

        assert!(!is_safe_segment_name("../etc/passwd"));
        assert!(!is_safe_segment_name("a/b.ts"));
        assert!(!is_safe_segment_name("segment.mp4"));
        assert!(!is_safe_segment_name(".ts"));
        assert!(!is_safe_segment_name("segment_1.ts.bak"));
    }

    #[test]
    fn owner_key_round_trips() {
        let key = owner_key("s1");
        assert_eq!(stream_of_owner_key(&key), Some("s1"));
        assert_eq!(stream_of_owner_key("heartbeat:w1"), None);
    }

    #[test]
    fn events_channel_round_trips() {
        let channel = events_channel("s1");
        assert_eq!(stream_of_events_channel(&channel), Some("s1"));
    }
}
