// SPDX-FileCopyrightText: © 2025 Livereel Contributors
//
// SPDX-License-Identifier: MPL-2.0

#![cfg(unix)]
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::disallowed_macros,
    clippy::uninlined_format_args,
    clippy::manual_let_else
)]

//! Per-stream transcode task tests with in-memory backends and a scripted
//! stand-in muxer (reads stdin to EOF, then emits segments and a manifest
//! the way the real muxer's final flush does).

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use livereel_api::ProgressEvent;
use livereel_broker::{Broker, MemoryBroker, Subscription};
use livereel_core::{keys, ChunkRecord, StreamState, StreamStatus};
use livereel_server::worker::transcode::{self, StreamContext};
use livereel_storage::{MemoryStore, ObjectStore};

const PREFIX: &str = "recordings/2026/08/01";
const STREAM: &str = "s1";

struct Harness {
    broker: Arc<MemoryBroker>,
    store: Arc<MemoryStore>,
    temp: tempfile::TempDir,
    draining: Arc<AtomicBool>,
    kill: CancellationToken,
}

impl Harness {
    async fn new() -> Self {
        let broker = MemoryBroker::new();
        let store = MemoryStore::new();
        let temp = tempfile::tempdir().unwrap();

        let state = StreamState::new("media", PREFIX, 1_000);
        broker.hash_set(&keys::state_key(STREAM), &state.to_fields()).await.unwrap();
        broker.set(&keys::owner_key(STREAM), "w1", None).await.unwrap();

        Self {
            broker,
            store,
            temp,
            draining: Arc::new(AtomicBool::new(false)),
            kill: CancellationToken::new(),
        }
    }

    /// Writes an executable stand-in muxer. `body` runs with `$dir` set to
    /// the output directory (the worker passes the manifest path last).
    fn write_muxer(&self, body: &str) -> PathBuf {
        let script = format!(
            "#!/bin/sh\nfor last in \"$@\"; do :; done\ndir=$(dirname \"$last\")\n{body}\n"
        );
        let path = self.temp.path().join("fake-muxer.sh");
        std::fs::write(&path, script).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn stdin_capture_path(&self) -> PathBuf {
        self.temp.path().join("captured-stdin.bin")
    }

    async fn seed_chunk(&self, seq: u64, data: &[u8]) {
        let key = keys::chunk_key(PREFIX, STREAM, seq);
        self.store
            .put_bytes(&key, bytes::Bytes::copy_from_slice(data), "video/webm")
            .await
            .unwrap();
        self.append_chunk_entry(seq, &key, data.len() as u64).await;
    }

    /// Appends a chunk-log entry without necessarily having the object.
    async fn append_chunk_entry(&self, seq: u64, key: &str, size: u64) {
        let record = ChunkRecord { seq, key: key.to_string(), size, timestamp: 1_000 + seq as i64 };
        self.broker
            .log_append(&keys::chunk_log(STREAM), &serde_json::to_string(&record).unwrap())
            .await
            .unwrap();
    }

    fn context(&self, muxer: &Path) -> StreamContext {
        StreamContext {
            stream_id: STREAM.to_string(),
            prefix: PREFIX.to_string(),
            worker_id: "w1".to_string(),
            broker: self.broker.clone(),
            store: self.store.clone(),
            muxer_program: muxer.display().to_string(),
            segment_seconds: 4,
            temp_root: self.temp.path().join("work"),
            draining: Arc::clone(&self.draining),
            kill: self.kill.clone(),
        }
    }

    async fn subscribe_events(&self) -> Subscription {
        self.broker.subscribe(keys::EVENTS_PATTERN).await.unwrap()
    }

    async fn status(&self) -> Option<String> {
        self.broker.hash_get(&keys::state_key(STREAM), "status").await.unwrap()
    }
}

async fn collect_events(sub: &mut Subscription) -> Vec<ProgressEvent> {
    let mut events = Vec::new();
    while let Ok(Some((_, payload))) = timeout(Duration::from_millis(200), sub.next()).await {
        events.push(serde_json::from_str(&payload).unwrap());
    }
    events
}

/// The standard script: capture stdin, emit two segments and a frozen
/// manifest listing both.
fn two_segment_body(capture: &Path) -> String {
    format!(
        concat!(
            "cat > {capture}\n",
            "printf 'SEGDATA0' > \"$dir/segment_00000.ts\"\n",
            "printf 'SEGDATA11' > \"$dir/segment_00001.ts\"\n",
            "{{ echo '#EXTM3U'; echo '#EXT-X-VERSION:3'; ",
            "echo '#EXTINF:4.0,'; echo 'segment_00000.ts'; ",
            "echo '#EXTINF:4.0,'; echo 'segment_00001.ts'; ",
            "echo '#EXT-X-ENDLIST'; }} > \"$dir/stream.m3u8\"\n",
            "exit 0"
        ),
        capture = capture.display()
    )
}

#[tokio::test]
async fn transcodes_chunks_in_order_and_uploads_outputs() {
    let harness = Harness::new().await;
    let capture = harness.stdin_capture_path();
    let muxer = harness.write_muxer(&two_segment_body(&capture));
    let mut events = harness.subscribe_events().await;

    harness.seed_chunk(0, b"AAAA").await;
    harness.seed_chunk(1, b"BB").await;
    harness.seed_chunk(2, b"CCC").await;

    let task = tokio::spawn(transcode::run(harness.context(&muxer)));
    tokio::time::sleep(Duration::from_millis(300)).await;
    harness.draining.store(true, Ordering::Relaxed);
    timeout(Duration::from_secs(20), task).await.unwrap().unwrap();

    // Chunks reached the muxer in strict sequence order.
    assert_eq!(std::fs::read(&capture).unwrap(), b"AAAABBCCC");

    // Segments and manifest landed under the HLS prefix with the right
    // content types.
    let segment = harness
        .store
        .object(&keys::hls_key(PREFIX, STREAM, "segment_00000.ts"))
        .expect("first segment uploaded");
    assert_eq!(&segment.data[..], b"SEGDATA0");
    assert_eq!(segment.content_type, "video/mp2t");

    let manifest = harness
        .store
        .object(&keys::manifest_key(PREFIX, STREAM))
        .expect("manifest uploaded");
    assert_eq!(manifest.content_type, "application/vnd.apple.mpegurl");
    assert!(manifest.cache_control.as_deref().unwrap().contains("no-cache"));
    let manifest_text = String::from_utf8(manifest.data.to_vec()).unwrap();
    assert!(manifest_text.contains("segment_00000.ts"));
    assert!(manifest_text.contains("#EXT-X-ENDLIST"));

    // Progress events: transcoding, one SegmentReady per segment, a
    // manifest update, then Ready and exactly one StreamComplete.
    let events = collect_events(&mut events).await;
    let segment_names: Vec<_> = events
        .iter()
        .filter_map(|event| match event {
            ProgressEvent::SegmentReady { name, .. } => Some(name.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(segment_names.len(), 2);
    assert!(segment_names.contains(&"segment_00000.ts".to_string()));
    assert!(segment_names.contains(&"segment_00001.ts".to_string()));

    let completes: Vec<_> = events
        .iter()
        .filter_map(|event| match event {
            ProgressEvent::StreamComplete { segment_count, total_bytes } => {
                Some((*segment_count, *total_bytes))
            },
            _ => None,
        })
        .collect();
    assert_eq!(completes, vec![(2, 17)]);

    assert!(events
        .iter()
        .any(|e| matches!(e, ProgressEvent::ManifestUpdated { key } if key.ends_with("stream.m3u8"))));

    // Terminal state, released ownership, removed temp dir.
    assert_eq!(harness.status().await.as_deref(), Some("Complete"));
    assert_eq!(harness.broker.get(&keys::owner_key(STREAM)).await.unwrap(), None);
    assert!(!harness.temp.path().join("work").join(STREAM).exists());
}

#[tokio::test]
async fn buffers_out_of_order_chunks_until_the_gap_fills() {
    let harness = Harness::new().await;
    let capture = harness.stdin_capture_path();
    let muxer = harness.write_muxer(&two_segment_body(&capture));

    harness.seed_chunk(0, b"A0").await;
    harness.seed_chunk(1, b"B1").await;
    harness.seed_chunk(3, b"D3").await;

    let task = tokio::spawn(transcode::run(harness.context(&muxer)));
    tokio::time::sleep(Duration::from_millis(300)).await;

    // The gap fills while the stream is live; 2 then 3 must apply.
    harness.seed_chunk(2, b"C2").await;
    tokio::time::sleep(Duration::from_millis(700)).await;

    harness.draining.store(true, Ordering::Relaxed);
    timeout(Duration::from_secs(20), task).await.unwrap().unwrap();

    assert_eq!(std::fs::read(&capture).unwrap(), b"A0B1C2D3");
    assert_eq!(harness.status().await.as_deref(), Some("Complete"));
}

#[tokio::test]
async fn abandons_an_open_gap_after_drain_grace() {
    let harness = Harness::new().await;
    let capture = harness.stdin_capture_path();
    let muxer = harness.write_muxer(&two_segment_body(&capture));

    harness.seed_chunk(0, b"A0").await;
    harness.seed_chunk(1, b"B1").await;
    harness.seed_chunk(3, b"D3").await; // seq 2 never arrives

    let task = tokio::spawn(transcode::run(harness.context(&muxer)));
    tokio::time::sleep(Duration::from_millis(300)).await;

    harness
        .broker
        .hash_set_field(&keys::state_key(STREAM), "status", StreamStatus::Ending.as_str())
        .await
        .unwrap();
    harness.draining.store(true, Ordering::Relaxed);
    timeout(Duration::from_secs(20), task).await.unwrap().unwrap();

    // Only the dense prefix was applied.
    assert_eq!(std::fs::read(&capture).unwrap(), b"A0B1");
    // Ending + clean muxer exit + uploaded segments = normal finalization.
    assert_eq!(harness.status().await.as_deref(), Some("Complete"));
}

#[tokio::test]
async fn muxer_crash_during_live_finalizes_in_error_mode() {
    let harness = Harness::new().await;
    let muxer = harness.write_muxer("exit 1");
    let mut events = harness.subscribe_events().await;

    let task = tokio::spawn(transcode::run(harness.context(&muxer)));
    timeout(Duration::from_secs(20), task).await.unwrap().unwrap();

    let events = collect_events(&mut events).await;
    assert!(events
        .iter()
        .any(|e| matches!(e, ProgressEvent::StreamError { .. })));
    assert!(!events
        .iter()
        .any(|e| matches!(e, ProgressEvent::StreamComplete { .. })));

    assert_eq!(harness.status().await.as_deref(), Some("Error"));
    assert_eq!(harness.broker.get(&keys::owner_key(STREAM)).await.unwrap(), None);
    assert!(!harness.temp.path().join("work").join(STREAM).exists());
}

#[tokio::test]
async fn empty_stream_completes_with_zero_segments() {
    let harness = Harness::new().await;
    let muxer = harness.write_muxer("cat > /dev/null\nexit 0");
    let mut events = harness.subscribe_events().await;

    harness.draining.store(true, Ordering::Relaxed);
    let task = tokio::spawn(transcode::run(harness.context(&muxer)));
    timeout(Duration::from_secs(20), task).await.unwrap().unwrap();

    let events = collect_events(&mut events).await;
    assert!(events
        .iter()
        .any(|e| matches!(e, ProgressEvent::StreamComplete { segment_count: 0, total_bytes: 0 })));
    assert_eq!(harness.status().await.as_deref(), Some("Complete"));
}

#[tokio::test]
async fn persistent_chunk_fetch_failure_finalizes_in_error_mode() {
    let harness = Harness::new().await;
    let capture = harness.stdin_capture_path();
    let muxer = harness.write_muxer(&two_segment_body(&capture));
    let mut events = harness.subscribe_events().await;

    // Log entry with no backing object: every GET fails.
    harness
        .append_chunk_entry(0, &keys::chunk_key(PREFIX, STREAM, 0), 64)
        .await;

    let task = tokio::spawn(transcode::run(harness.context(&muxer)));
    timeout(Duration::from_secs(20), task).await.unwrap().unwrap();

    let events = collect_events(&mut events).await;
    assert!(events.iter().any(|e| matches!(
        e,
        ProgressEvent::StreamError { reason } if reason.contains("fetch failed")
    )));
    assert_eq!(harness.status().await.as_deref(), Some("Error"));
}
