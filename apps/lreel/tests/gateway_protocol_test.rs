// SPDX-FileCopyrightText: © 2025 Livereel Contributors
//
// SPDX-License-Identifier: MPL-2.0

#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::disallowed_macros,
    clippy::uninlined_format_args,
    clippy::manual_let_else
)]

//! Gateway protocol tests against a real listener with in-memory backends.

use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};

use livereel_broker::{Broker, Cursor, MemoryBroker};
use livereel_core::{keys, ChunkRecord};
use livereel_records::{MemoryRecordStore, RecordingStore};
use livereel_server::config::{Config, StorageBackend};
use livereel_server::gateway::{events, server, state::AppState};
use livereel_storage::MemoryStore;

struct Harness {
    addr: SocketAddr,
    broker: Arc<MemoryBroker>,
    store: Arc<MemoryStore>,
    records: Arc<MemoryRecordStore>,
    _server: tokio::task::JoinHandle<()>,
    _relay: tokio::task::JoinHandle<()>,
}

async fn start_test_gateway() -> Option<Harness> {
    let listener = match TcpListener::bind("127.0.0.1:0").await {
        Ok(listener) => listener,
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => return None,
        Err(e) => panic!("Failed to bind test listener: {e}"),
    };
    let addr = listener.local_addr().unwrap();

    let mut config = Config::default();
    config.storage.backend = StorageBackend::Memory;
    config.storage.bucket = "media".to_string();

    let broker = MemoryBroker::new();
    let store = MemoryStore::new();
    let records = MemoryRecordStore::new();

    let app_state = Arc::new(AppState::new(
        config,
        broker.clone(),
        store.clone(),
        records.clone(),
    ));

    let relay = tokio::spawn(events::run_event_relay(Arc::clone(&app_state)));

    let app = server::create_app(Arc::clone(&app_state));
    let server = tokio::spawn(async move {
        axum::serve(listener, app.into_make_service()).await.unwrap();
    });

    tokio::time::sleep(Duration::from_millis(50)).await;

    Some(Harness { addr, broker, store, records, _server: server, _relay: relay })
}

type WsClient = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

async fn connect(addr: SocketAddr) -> WsClient {
    let url = format!("ws://{}/ws/stream", addr);
    let (stream, _) = connect_async(&url).await.expect("Failed to connect");
    stream
}

async fn next_json(client: &mut WsClient) -> serde_json::Value {
    loop {
        let message = timeout(Duration::from_secs(5), client.next())
            .await
            .expect("Timeout waiting for frame")
            .expect("Connection ended")
            .expect("Failed to read frame");
        if let WsMessage::Text(text) = message {
            return serde_json::from_str(&text).expect("Frame is not JSON");
        }
    }
}

/// Waits for a frame whose `type` matches, skipping broadcast frames of
/// other types (viewers share the channel).
async fn next_json_of_type(client: &mut WsClient, frame_type: &str) -> serde_json::Value {
    for _ in 0..50 {
        let value = next_json(client).await;
        if value["type"] == frame_type {
            return value;
        }
    }
    panic!("No {frame_type} frame arrived");
}

async fn send_start(client: &mut WsClient, recording_id: &str) {
    let frame = format!(r#"{{"type":"start","recordingId":"{recording_id}"}}"#);
    client.send(WsMessage::Text(frame.into())).await.expect("Failed to send start");
}

#[tokio::test]
async fn happy_path_ingests_chunks_in_order() {
    let Some(harness) = start_test_gateway().await else {
        eprintln!("Skipping gateway tests: local TCP bind not permitted");
        return;
    };

    let mut client = connect(harness.addr).await;

    send_start(&mut client, "s1").await;
    let started = next_json_of_type(&mut client, "started").await;
    assert_eq!(started["recordingId"], "s1");
    assert_eq!(started["status"], "Live");

    // Three binary chunks
    for byte in [b'a', b'b', b'c'] {
        let chunk = vec![byte; 1024];
        client.send(WsMessage::Binary(chunk.into())).await.expect("Failed to send chunk");
    }

    let stop = r#"{"type":"stop","duration":3,"pauseCount":0,"pauseDurationTotal":0,"pauseEvents":[]}"#;
    client.send(WsMessage::Text(stop.into())).await.expect("Failed to send stop");
    let stopped = next_json_of_type(&mut client, "stopped").await;
    assert_eq!(stopped["recordingId"], "s1");
    assert_eq!(stopped["status"], "Ending");

    // Every committed chunk-log entry names a fetchable object with the
    // bit-exact key layout.
    let entries = harness
        .broker
        .log_read(&keys::chunk_log("s1"), &Cursor::Start, None)
        .await
        .unwrap();
    assert_eq!(entries.len(), 3);
    for (i, entry) in entries.iter().enumerate() {
        let record: ChunkRecord = serde_json::from_str(&entry.payload).unwrap();
        assert_eq!(record.seq, i as u64);
        assert!(record.key.ends_with(&format!("/s1/chunks/chunk_{:08}.webm", i)));
        assert_eq!(record.size, 1024);
        assert!(harness.store.object(&record.key).is_some());
    }

    assert_eq!(
        harness.broker.hash_get(&keys::state_key("s1"), "chunk_count").await.unwrap().as_deref(),
        Some("3")
    );
    assert_eq!(
        harness.broker.hash_get(&keys::state_key("s1"), "status").await.unwrap().as_deref(),
        Some("Ending")
    );

    // One StreamStart and one StreamStop on the control log.
    let control = harness
        .broker
        .log_read(keys::CONTROL_LOG, &Cursor::Start, None)
        .await
        .unwrap();
    assert_eq!(control.len(), 2);
    assert!(control[0].payload.contains("stream_start"));
    assert!(control[1].payload.contains("stream_stop"));

    // Second stop: same terminal ack, no extra control append.
    client.send(WsMessage::Text(r#"{"type":"stop"}"#.into())).await.unwrap();
    let stopped_again = next_json_of_type(&mut client, "stopped").await;
    assert_eq!(stopped_again["status"], "Ending");
    let control = harness
        .broker
        .log_read(keys::CONTROL_LOG, &Cursor::Start, None)
        .await
        .unwrap();
    assert_eq!(control.len(), 2);

    // Recording record picked up the start/stop field updates.
    let recording = harness.records.get("s1").await.unwrap().unwrap();
    assert_eq!(recording.status, "recording");
    assert!(recording.storage_key.unwrap().ends_with("hls/stream.m3u8"));
    assert_eq!(recording.duration, Some(3.0));
}

#[tokio::test]
async fn binary_before_start_is_a_protocol_error() {
    let Some(harness) = start_test_gateway().await else {
        eprintln!("Skipping gateway tests: local TCP bind not permitted");
        return;
    };

    let mut client = connect(harness.addr).await;
    client.send(WsMessage::Binary(vec![0u8; 16].into())).await.unwrap();

    let error = next_json(&mut client).await;
    assert_eq!(error["type"], "error");
    assert!(error["detail"].as_str().unwrap().contains("before start"));

    // The gateway closes the connection afterwards.
    let followup = timeout(Duration::from_secs(5), client.next()).await.expect("Timeout");
    match followup {
        None | Some(Ok(WsMessage::Close(_))) | Some(Err(_)) => {},
        Some(Ok(other)) => panic!("Expected close, got {other:?}"),
    }
}

#[tokio::test]
async fn ping_elicits_wall_clock_pong() {
    let Some(harness) = start_test_gateway().await else {
        eprintln!("Skipping gateway tests: local TCP bind not permitted");
        return;
    };

    let mut client = connect(harness.addr).await;
    client.send(WsMessage::Text(r#"{"type":"ping"}"#.into())).await.unwrap();

    let pong = next_json_of_type(&mut client, "pong").await;
    let timestamp = pong["timestamp"].as_i64().unwrap();
    let now = livereel_core::unix_ms_now();
    assert!((now - timestamp).abs() < 1_000, "pong timestamp not within 1s of wall clock");
}

#[tokio::test]
async fn second_recorder_for_same_stream_is_rejected() {
    let Some(harness) = start_test_gateway().await else {
        eprintln!("Skipping gateway tests: local TCP bind not permitted");
        return;
    };

    let mut first = connect(harness.addr).await;
    send_start(&mut first, "s1").await;
    let _ = next_json_of_type(&mut first, "started").await;

    let mut second = connect(harness.addr).await;
    send_start(&mut second, "s1").await;
    let error = next_json(&mut second).await;
    assert_eq!(error["type"], "error");
    assert!(error["detail"].as_str().unwrap().contains("already attached"));
}

#[tokio::test]
async fn disconnect_while_live_is_an_implicit_stop() {
    let Some(harness) = start_test_gateway().await else {
        eprintln!("Skipping gateway tests: local TCP bind not permitted");
        return;
    };

    let mut client = connect(harness.addr).await;
    send_start(&mut client, "s1").await;
    let _ = next_json_of_type(&mut client, "started").await;

    drop(client);
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(
        harness.broker.hash_get(&keys::state_key("s1"), "status").await.unwrap().as_deref(),
        Some("Ending")
    );
    let control = harness
        .broker
        .log_read(keys::CONTROL_LOG, &Cursor::Start, None)
        .await
        .unwrap();
    assert!(control.last().unwrap().payload.contains("stream_stop"));

    // Empty recorder statistics on the implicit path.
    let recording = harness.records.get("s1").await.unwrap().unwrap();
    assert_eq!(recording.duration, Some(0.0));
    assert_eq!(recording.pause_count, Some(0));
}

#[tokio::test]
async fn viewers_receive_progress_fanout() {
    let Some(harness) = start_test_gateway().await else {
        eprintln!("Skipping gateway tests: local TCP bind not permitted");
        return;
    };

    let mut viewer = connect(harness.addr).await;
    // Authenticate nothing: viewers just hold the socket open.
    tokio::time::sleep(Duration::from_millis(50)).await;

    harness
        .broker
        .publish(
            &keys::events_channel("s1"),
            r#"{"type":"segment_ready","name":"segment_00000.ts","size":1024}"#,
        )
        .await
        .unwrap();
    harness
        .broker
        .publish(
            &keys::events_channel("s1"),
            r#"{"type":"stream_complete","segment_count":1,"total_bytes":1024}"#,
        )
        .await
        .unwrap();

    let segment = next_json_of_type(&mut viewer, "segmentReady").await;
    assert_eq!(segment["streamId"], "s1");
    assert_eq!(segment["name"], "segment_00000.ts");
    assert_eq!(segment["size"], 1024);

    let complete = next_json_of_type(&mut viewer, "streamComplete").await;
    assert_eq!(complete["segmentCount"], 1);
    assert_eq!(complete["totalBytes"], 1024);

    // The terminal event also drove the idempotent recording update.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let recording = harness.records.get("s1").await.unwrap().unwrap();
    assert_eq!(recording.file_bytes, Some(1024));
    assert!(!recording.is_live_streaming);
}

#[tokio::test]
async fn rest_fallback_reports_status_and_stops() {
    let Some(harness) = start_test_gateway().await else {
        eprintln!("Skipping gateway tests: local TCP bind not permitted");
        return;
    };
    let base = format!("http://{}", harness.addr);
    let http = reqwest::Client::new();

    // Health endpoint.
    let health = http.get(format!("{base}/healthz")).send().await.unwrap();
    assert!(health.status().is_success());

    // Unknown stream: error envelope.
    let missing = http.get(format!("{base}/api/v1/streams/nope")).send().await.unwrap();
    assert_eq!(missing.status().as_u16(), 404);
    let envelope: serde_json::Value = missing.json().await.unwrap();
    assert_eq!(envelope["code"], "stream_not_found");
    assert!(envelope["title"].is_string());
    assert!(envelope["detail"].is_string());

    // Start a stream over websocket, then read it over REST.
    let mut client = connect(harness.addr).await;
    send_start(&mut client, "s2").await;
    let _ = next_json_of_type(&mut client, "started").await;

    let status = http.get(format!("{base}/api/v1/streams/s2")).send().await.unwrap();
    assert!(status.status().is_success());
    let document: serde_json::Value = status.json().await.unwrap();
    assert_eq!(document["data"]["id"], "s2");
    assert_eq!(document["data"]["type"], "stream");
    assert_eq!(document["data"]["attributes"]["status"], "Live");
    assert!(document["data"]["attributes"]["storageKey"]
        .as_str()
        .unwrap()
        .ends_with("hls/stream.m3u8"));

    // Stop via REST; idempotent on repeat.
    for _ in 0..2 {
        let stopped = http
            .post(format!("{base}/api/v1/streams/s2/stop"))
            .send()
            .await
            .unwrap();
        assert!(stopped.status().is_success());
        let document: serde_json::Value = stopped.json().await.unwrap();
        assert_eq!(document["data"]["attributes"]["status"], "Ending");
    }

    let control = harness
        .broker
        .log_read(keys::CONTROL_LOG, &Cursor::Start, None)
        .await
        .unwrap();
    let stops = control.iter().filter(|e| e.payload.contains("stream_stop")).count();
    assert_eq!(stops, 1);
}
