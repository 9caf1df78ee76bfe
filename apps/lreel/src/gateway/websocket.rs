// SPDX-FileCopyrightText: © 2025 Livereel Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! gateway/websocket.rs: The recorder connection state machine.
//!
//! Each connection starts unauthenticated: the first frame must be a text
//! `start`. Afterwards binary frames are media chunks and text frames are
//! `stop`/`ping`. Progress events relayed from the broker are broadcast to
//! every open connection.

use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use opentelemetry::{global, KeyValue};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::sync::OnceLock;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};

use livereel_api::{ClientFrame, ServerFrame};
use livereel_broker::BrokerError;
use livereel_core::{
    keys, unix_ms_now, ChunkRecord, PipelineError, StreamState, StreamStats, StreamStatus,
};

use crate::gateway::state::AppState;

static ACTIVE_CONNECTIONS: AtomicU64 = AtomicU64::new(0);

/// Attempts for control-log appends. Chunk-log appends are not retried (the
/// orphan object is tolerated), but losing a lifecycle event would strand
/// the stream.
const CONTROL_APPEND_ATTEMPTS: u32 = 3;
const CONTROL_APPEND_BACKOFF: Duration = Duration::from_millis(100);

/// Helper function to send a JSON frame over WebSocket with consistent error
/// handling. Returns `Err(())` if serialization or sending failed
/// (indicating the connection should be closed).
async fn send_frame<T: Serialize + Sync>(
    socket: &mut WebSocket,
    frame: &T,
    frame_kind: &str,
) -> Result<(), ()> {
    match serde_json::to_string(frame) {
        Ok(json) => {
            if socket.send(Message::Text(json.into())).await.is_err() {
                warn!("Failed to send WebSocket {}", frame_kind);
                Err(())
            } else {
                Ok(())
            }
        },
        Err(e) => {
            error!(error = %e, "Failed to serialize {}", frame_kind);
            Err(())
        },
    }
}

/// Metrics for recorder connection handling
#[derive(Clone)]
struct GatewayMetrics {
    connections_gauge: opentelemetry::metrics::Gauge<u64>,
    chunks_counter: opentelemetry::metrics::Counter<u64>,
    chunk_bytes_counter: opentelemetry::metrics::Counter<u64>,
    errors_counter: opentelemetry::metrics::Counter<u64>,
}

impl GatewayMetrics {
    fn shared() -> Self {
        static METRICS: OnceLock<GatewayMetrics> = OnceLock::new();
        METRICS
            .get_or_init(|| {
                let meter = global::meter("lreel_gateway");
                Self {
                    connections_gauge: meter
                        .u64_gauge("websocket.connections.active")
                        .with_description("Number of active WebSocket connections")
                        .build(),
                    chunks_counter: meter
                        .u64_counter("ingest.chunks")
                        .with_description("Total media chunks committed")
                        .build(),
                    chunk_bytes_counter: meter
                        .u64_counter("ingest.chunk_bytes")
                        .with_description("Total media bytes committed")
                        .build(),
                    errors_counter: meter
                        .u64_counter("websocket.errors")
                        .with_description("WebSocket errors")
                        .build(),
                }
            })
            .clone()
    }
}

/// Connection-local stream state. The sequence counter lives here because
/// the recorder is singular per stream.
struct ActiveStream {
    id: String,
    prefix: String,
    next_seq: u64,
    stopped: bool,
}

enum Flow {
    Continue,
    Close,
}

struct Connection {
    state: Arc<AppState>,
    metrics: GatewayMetrics,
    stream: Option<ActiveStream>,
}

async fn append_control_with_retry(
    state: &AppState,
    payload: &str,
) -> Result<(), BrokerError> {
    let mut attempt = 0;
    loop {
        match state.broker.log_append(keys::CONTROL_LOG, payload).await {
            Ok(_) => return Ok(()),
            Err(e) if attempt + 1 < CONTROL_APPEND_ATTEMPTS => {
                attempt += 1;
                warn!(error = %e, attempt, "Control log append failed; retrying");
                tokio::time::sleep(CONTROL_APPEND_BACKOFF * 2_u32.pow(attempt - 1)).await;
            },
            Err(e) => return Err(e),
        }
    }
}

impl Connection {
    /// Handles a `start` frame. On success the connection is authenticated
    /// and registered as the stream's recorder.
    #[allow(clippy::too_many_lines)]
    async fn handle_start(&mut self, socket: &mut WebSocket, recording_id: String) -> Flow {
        if self.stream.is_some() {
            let detail =
                PipelineError::Protocol("duplicate start on this connection".to_string())
                    .to_string();
            let _ = send_frame(socket, &ServerFrame::Error { detail }, "error").await;
            return Flow::Close;
        }

        let now = unix_ms_now();

        // Reserve the stream before touching the broker so two racing
        // recorders cannot both proceed.
        {
            let mut manager = self.state.streams.lock().await;
            if !manager.attach(&recording_id, now) {
                drop(manager);
                let detail = PipelineError::Protocol(format!(
                    "a recorder is already attached to {recording_id}"
                ))
                .to_string();
                let _ = send_frame(socket, &ServerFrame::Error { detail }, "error").await;
                return Flow::Close;
            }
        }

        match self.start_stream(&recording_id, now).await {
            Ok((next_seq, prefix)) => {
                self.stream = Some(ActiveStream {
                    id: recording_id.clone(),
                    prefix,
                    next_seq,
                    stopped: false,
                });
                info!(stream_id = %recording_id, next_seq, "Stream live");
                if send_frame(
                    socket,
                    &ServerFrame::Started { recording_id, status: StreamStatus::Live },
                    "started ack",
                )
                .await
                .is_err()
                {
                    return Flow::Close;
                }
                Flow::Continue
            },
            Err(e) => {
                self.state.streams.lock().await.detach(&recording_id);
                self.metrics.errors_counter.add(1, &[KeyValue::new("error_type", "start_rejected")]);
                let _ = send_frame(socket, &ServerFrame::Error { detail: e.to_string() }, "error")
                    .await;
                Flow::Close
            },
        }
    }

    /// Creates or resumes the broker-side stream record. Returns the next
    /// chunk sequence number and the object-key prefix in effect.
    async fn start_stream(
        &self,
        stream_id: &str,
        now: i64,
    ) -> Result<(u64, String), PipelineError> {
        let state_key = keys::state_key(stream_id);
        let fields = self
            .state
            .broker
            .hash_get_all(&state_key)
            .await
            .map_err(|e| PipelineError::Broker(e.to_string()))?;

        let bucket = self.state.config.storage.bucket.clone();
        let mut prefix = keys::today_prefix();

        let next_seq = if fields.is_empty() {
            let stream_state = StreamState::new(bucket.clone(), prefix.clone(), now);
            self.state
                .broker
                .hash_set(&state_key, &stream_state.to_fields())
                .await
                .map_err(|e| PipelineError::Broker(e.to_string()))?;
            0
        } else {
            // Re-attachment: permitted only while no transcoder owns the
            // stream, and never after a terminal status.
            let existing =
                StreamState::from_fields(&fields).map_err(PipelineError::Broker)?;
            if existing.status.is_terminal() {
                return Err(PipelineError::Protocol(format!(
                    "stream {stream_id} already reached {}",
                    existing.status
                )));
            }
            let owner = self
                .state
                .broker
                .get(&keys::owner_key(stream_id))
                .await
                .map_err(|e| PipelineError::Broker(e.to_string()))?;
            if let Some(owner) = owner {
                return Err(PipelineError::Ownership(format!(
                    "stream {stream_id} is already claimed by worker {owner}"
                )));
            }
            self.state
                .broker
                .hash_set_field(&state_key, "status", StreamStatus::Live.as_str())
                .await
                .map_err(|e| PipelineError::Broker(e.to_string()))?;
            prefix = existing.prefix;
            existing.chunk_count
        };

        // Re-announcing an already-claimed stream is harmless: claims are
        // set-if-absent, so losers ignore it.
        let control = livereel_api::ControlEvent::StreamStart {
            stream_id: stream_id.to_string(),
            bucket: bucket.clone(),
            prefix: prefix.clone(),
        };
        let payload = serde_json::to_string(&control)
            .map_err(|e| PipelineError::Broker(format!("encoding control event: {e}")))?;
        append_control_with_retry(&self.state, &payload)
            .await
            .map_err(|e| PipelineError::Broker(e.to_string()))?;

        let manifest_key = keys::manifest_key(&prefix, stream_id);
        if let Err(e) = self
            .state
            .records
            .mark_streaming_started(stream_id, &bucket, &manifest_key, now)
            .await
        {
            warn!(stream_id = %stream_id, error = %e, "Recording record update failed on start");
        }

        Ok((next_seq, prefix))
    }

    /// Handles one binary media chunk.
    ///
    /// Ordering is load-bearing: the object write must succeed before the
    /// chunk counter advances and the log entry is appended, so a reader
    /// observing sequence `n` can unconditionally fetch `n`.
    async fn handle_chunk(&mut self, socket: &mut WebSocket, data: Bytes) -> Flow {
        let Some(stream) = &mut self.stream else {
            self.metrics.errors_counter.add(1, &[KeyValue::new("error_type", "chunk_before_start")]);
            let detail =
                PipelineError::Protocol("binary frame before start".to_string()).to_string();
            let _ = send_frame(socket, &ServerFrame::Error { detail }, "error").await;
            return Flow::Close;
        };

        if stream.stopped {
            let detail =
                PipelineError::Protocol("binary frame after stop".to_string()).to_string();
            let _ = send_frame(socket, &ServerFrame::Error { detail }, "error").await;
            return Flow::Close;
        }

        let seq = stream.next_seq;
        let size = data.len() as u64;
        let key = keys::chunk_key(&stream.prefix, &stream.id, seq);

        if let Err(e) = self.state.store.put_bytes(&key, data, "video/webm").await {
            // The sequence counter does not advance, so the recorder can
            // retry the same chunk.
            warn!(stream_id = %stream.id, seq, error = %e, "Chunk object write failed");
            self.metrics.errors_counter.add(1, &[KeyValue::new("error_type", "chunk_put_failed")]);
            let _ = send_frame(
                socket,
                &ServerFrame::Error { detail: format!("chunk {seq} write failed, retry") },
                "error",
            )
            .await;
            return Flow::Continue;
        }

        stream.next_seq = seq + 1;

        // Broker failures past this point are tolerated: the object exists,
        // and the next successful append restores forward progress (readers
        // skip gaps by consulting chunk_count).
        if let Err(e) = self
            .state
            .broker
            .hash_incr(&keys::state_key(&stream.id), "chunk_count", 1)
            .await
        {
            warn!(stream_id = %stream.id, seq, error = %e, "Chunk counter increment failed");
        }

        let record = ChunkRecord { seq, key, size, timestamp: unix_ms_now() };
        match serde_json::to_string(&record) {
            Ok(payload) => {
                if let Err(e) =
                    self.state.broker.log_append(&keys::chunk_log(&stream.id), &payload).await
                {
                    warn!(stream_id = %stream.id, seq, error = %e, "Chunk log append failed; orphan object tolerated");
                }
            },
            Err(e) => error!(stream_id = %stream.id, seq, error = %e, "Failed to encode chunk record"),
        }

        self.metrics.chunks_counter.add(1, &[]);
        self.metrics.chunk_bytes_counter.add(size, &[]);
        Flow::Continue
    }

    /// Handles a `stop` frame, or the implicit stop on disconnect.
    /// Idempotent: a second stop re-acks without a second control append.
    async fn handle_stop(
        &mut self,
        socket: Option<&mut WebSocket>,
        stats: StreamStats,
    ) -> Flow {
        let Some(stream) = &mut self.stream else {
            if let Some(socket) = socket {
                let detail =
                    PipelineError::Protocol("stop before start".to_string()).to_string();
                let _ = send_frame(socket, &ServerFrame::Error { detail }, "error").await;
            }
            return Flow::Close;
        };

        let stream_id = stream.id.clone();
        let already_stopped = stream.stopped;
        stream.stopped = true;

        if !already_stopped {
            if let Err(e) = self
                .state
                .broker
                .hash_set_field(&keys::state_key(&stream_id), "status", StreamStatus::Ending.as_str())
                .await
            {
                warn!(stream_id = %stream_id, error = %e, "Failed to mark stream ending");
            }

            let control =
                livereel_api::ControlEvent::StreamStop { stream_id: stream_id.clone(), stats: stats.clone() };
            match serde_json::to_string(&control) {
                Ok(payload) => {
                    if let Err(e) = append_control_with_retry(&self.state, &payload).await {
                        error!(stream_id = %stream_id, error = %e, "Control stop append failed");
                    }
                },
                Err(e) => error!(stream_id = %stream_id, error = %e, "Failed to encode control event"),
            }

            if let Err(e) =
                self.state.records.mark_streaming_stopped(&stream_id, &stats, unix_ms_now()).await
            {
                warn!(stream_id = %stream_id, error = %e, "Recording record update failed on stop");
            }

            self.state.streams.lock().await.detach(&stream_id);
            info!(stream_id = %stream_id, "Stream ending; finalization continues in background");
        }

        if let Some(socket) = socket {
            // The gateway does not wait for finalization; it acknowledges
            // immediately with the Ending status.
            if send_frame(
                socket,
                &ServerFrame::Stopped { recording_id: stream_id, status: StreamStatus::Ending },
                "stopped ack",
            )
            .await
            .is_err()
            {
                return Flow::Close;
            }
        }
        Flow::Continue
    }

    /// Handles a text control frame.
    async fn handle_text(&mut self, socket: &mut WebSocket, text: &str) -> Flow {
        let frame: ClientFrame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, frame_len = text.len(), "Failed to parse control frame");
                self.metrics.errors_counter.add(1, &[KeyValue::new("error_type", "parse_error")]);
                let detail =
                    PipelineError::Protocol(format!("invalid control frame: {e}")).to_string();
                let _ = send_frame(socket, &ServerFrame::Error { detail }, "error").await;
                return Flow::Close;
            },
        };

        match frame {
            ClientFrame::Start { recording_id } => self.handle_start(socket, recording_id).await,
            ClientFrame::Stop(stats) => self.handle_stop(Some(socket), stats).await,
            ClientFrame::Ping {} => {
                if send_frame(socket, &ServerFrame::Pong { timestamp: unix_ms_now() }, "pong")
                    .await
                    .is_err()
                {
                    return Flow::Close;
                }
                Flow::Continue
            },
        }
    }
}

/// Main recorder/viewer connection handler.
#[allow(clippy::cognitive_complexity)]
pub async fn handle_websocket(mut socket: WebSocket, app_state: Arc<AppState>) {
    info!("WebSocket connection established");

    let metrics = GatewayMetrics::shared();
    let active = ACTIVE_CONNECTIONS.fetch_add(1, Ordering::Relaxed) + 1;
    metrics.connections_gauge.record(active, &[]);

    let mut event_rx = app_state.event_tx.subscribe();
    let max_len = app_state.config.gateway.max_message_bytes;
    let mut conn = Connection { state: app_state, metrics: metrics.clone(), stream: None };

    loop {
        tokio::select! {
            // A frame was received from the recorder
            msg = socket.recv() => {
                let Some(msg) = msg else { break };
                match msg {
                    Ok(Message::Text(text)) => {
                        if text.len() > max_len {
                            warn!(frame_len = text.len(), max_len, "Rejected WebSocket frame: too large");
                            metrics
                                .errors_counter
                                .add(1, &[KeyValue::new("error_type", "message_too_large")]);
                            let _ = send_frame(
                                &mut socket,
                                &ServerFrame::Error {
                                    detail: format!("frame too large (max {max_len} bytes)"),
                                },
                                "error",
                            )
                            .await;
                            break;
                        }
                        if matches!(conn.handle_text(&mut socket, &text).await, Flow::Close) {
                            break;
                        }
                    }
                    Ok(Message::Binary(data)) => {
                        if data.len() > max_len {
                            warn!(frame_len = data.len(), max_len, "Rejected WebSocket frame: too large");
                            metrics
                                .errors_counter
                                .add(1, &[KeyValue::new("error_type", "message_too_large")]);
                            break;
                        }
                        if matches!(conn.handle_chunk(&mut socket, data).await, Flow::Close) {
                            break;
                        }
                    }
                    Ok(Message::Close(_)) => {
                        info!("WebSocket connection closed");
                        break;
                    }
                    Err(e) => {
                        // Connection errors are fatal for the connection only.
                        error!(error = %e, "WebSocket error");
                        metrics.errors_counter.add(1, &[KeyValue::new("error_type", "connection_error")]);
                        break;
                    }
                    _ => {}
                }
            },

            // A progress event was relayed from the broker. No per-viewer
            // filtering: viewers select their stream client-side.
            event_result = event_rx.recv() => {
                let frame = match event_result {
                    Ok(frame) => frame,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Event receiver lagged; dropping events to catch up");
                        metrics.errors_counter.add(1, &[KeyValue::new("error_type", "recv_lagged")]);
                        continue;
                    }
                    Err(RecvError::Closed) => {
                        warn!("Event channel closed; terminating connection");
                        break;
                    }
                };

                if send_frame(&mut socket, &frame, "event").await.is_err() {
                    break;
                }
            }
        }
    }

    // Recorder disconnect without a prior stop is an implicit stop with
    // empty statistics.
    if conn.stream.as_ref().is_some_and(|stream| !stream.stopped) {
        let _ = conn.handle_stop(None, StreamStats::default()).await;
    }
    if let Some(stream) = &conn.stream {
        conn.state.streams.lock().await.detach(&stream.id);
    }

    let prev = ACTIVE_CONNECTIONS.fetch_sub(1, Ordering::Relaxed);
    metrics.connections_gauge.record(prev.saturating_sub(1), &[]);
    info!("WebSocket connection terminated");
}
