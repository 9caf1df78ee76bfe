// SPDX-FileCopyrightText: © 2025 Livereel Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! worker/transcode: The per-stream transcoding task.
//!
//! Each owned stream runs one task composed of four concurrent activities
//! sharing a task-local state record:
//!
//! 1. the muxer driver (child process lifecycle),
//! 2. the chunk consumer (broker log -> object GET -> muxer stdin),
//! 3. the output poller (temp dir -> object PUT -> progress events),
//! 4. the finalizer (runs exactly once, after the muxer exits).

pub mod consumer;
pub mod muxer;
pub mod uploader;

use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use opentelemetry::global;
use std::sync::OnceLock;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use livereel_api::{ProgressEvent, TranscodeStatus};
use livereel_broker::Broker;
use livereel_core::constants::COMPLETE_RETENTION;
use livereel_core::{keys, StreamStatus};
use livereel_storage::ObjectStore;

/// Everything a per-stream task needs, owned at spawn time. External code
/// keeps only the stream id plus the drain/kill signals.
pub struct StreamContext {
    pub stream_id: String,
    pub prefix: String,
    pub worker_id: String,
    pub broker: Arc<dyn Broker>,
    pub store: Arc<dyn ObjectStore>,
    pub muxer_program: String,
    pub segment_seconds: u32,
    pub temp_root: PathBuf,
    /// Set by the control follower on `StreamStop`, or at spawn for
    /// reclaimed streams already in `Ending`.
    pub draining: Arc<AtomicBool>,
    /// Cancelled on shutdown after the graceful drain window lapses.
    pub kill: CancellationToken,
}

/// Task-local state shared by the subtasks. The mutex guards no I/O.
#[derive(Default)]
pub struct TaskState {
    pub uploaded: HashSet<String>,
    pub segment_count: u64,
    pub total_bytes: u64,
    pub last_manifest_mtime: Option<SystemTime>,
    pub last_applied_seq: Option<u64>,
    /// Last error-flagged muxer stderr lines (most recent last).
    pub muxer_errors: VecDeque<String>,
    /// Set by the consumer on a fatal (post-retry) failure.
    pub failed: Option<String>,
}

/// Stderr error lines retained for the terminal failure reason.
pub const MUXER_ERRORS_RETAINED: usize = 10;

pub type SharedState = Arc<Mutex<TaskState>>;

pub(crate) fn lock_state(state: &SharedState) -> std::sync::MutexGuard<'_, TaskState> {
    #[allow(clippy::unwrap_used)] // no panics happen while the lock is held
    state.lock().unwrap()
}

#[derive(Clone)]
struct TranscodeMetrics {
    streams_gauge: opentelemetry::metrics::Gauge<u64>,
    segments_counter: opentelemetry::metrics::Counter<u64>,
    bytes_counter: opentelemetry::metrics::Counter<u64>,
}

impl TranscodeMetrics {
    fn shared() -> Self {
        static METRICS: OnceLock<TranscodeMetrics> = OnceLock::new();
        METRICS
            .get_or_init(|| {
                let meter = global::meter("lreel_worker");
                Self {
                    streams_gauge: meter
                        .u64_gauge("transcode.streams.active")
                        .with_description("Streams currently being transcoded")
                        .build(),
                    segments_counter: meter
                        .u64_counter("transcode.segments")
                        .with_description("Segments uploaded")
                        .build(),
                    bytes_counter: meter
                        .u64_counter("transcode.segment_bytes")
                        .with_description("Segment bytes uploaded")
                        .build(),
                }
            })
            .clone()
    }
}

static ACTIVE_STREAMS: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(0);

/// Publishes a progress event on the stream's channel. Best-effort: a lost
/// event degrades viewer feedback, not correctness.
pub async fn publish_progress(broker: &dyn Broker, stream_id: &str, event: &ProgressEvent) {
    match serde_json::to_string(event) {
        Ok(payload) => {
            if let Err(e) = broker.publish(&keys::events_channel(stream_id), &payload).await {
                warn!(stream_id = %stream_id, error = %e, "Progress publish failed");
            }
        },
        Err(e) => error!(stream_id = %stream_id, error = %e, "Failed to encode progress event"),
    }
}

/// Runs the whole per-stream task to completion, including finalization.
#[allow(clippy::too_many_lines, clippy::cognitive_complexity)]
pub async fn run(ctx: StreamContext) {
    info!(stream_id = %ctx.stream_id, worker_id = %ctx.worker_id, "Transcode task starting");

    let metrics = TranscodeMetrics::shared();
    let active = ACTIVE_STREAMS.fetch_add(1, std::sync::atomic::Ordering::Relaxed) + 1;
    metrics.streams_gauge.record(active, &[]);

    publish_progress(
        ctx.broker.as_ref(),
        &ctx.stream_id,
        &ProgressEvent::StatusChange { status: TranscodeStatus::Transcoding },
    )
    .await;

    let out_dir = ctx.temp_root.join(&ctx.stream_id);
    let shared: SharedState = SharedState::default();
    let exit = run_pipeline(&ctx, &out_dir, &shared).await;

    match &exit {
        PipelineExit::Muxer(status) => {
            info!(stream_id = %ctx.stream_id, exit = ?status, "Muxer exited");
        },
        PipelineExit::SpawnFailed(reason) => {
            error!(stream_id = %ctx.stream_id, error = %reason, "Muxer spawn failed");
        },
    }

    finalize(&ctx, &out_dir, &shared, &exit, &metrics).await;

    let prev = ACTIVE_STREAMS.fetch_sub(1, std::sync::atomic::Ordering::Relaxed);
    metrics.streams_gauge.record(prev.saturating_sub(1), &[]);
}

enum PipelineExit {
    Muxer(Option<std::process::ExitStatus>),
    SpawnFailed(String),
}

/// Spawns the muxer and the three forwarding subtasks; returns when the
/// muxer has exited and the subtasks are quiesced.
async fn run_pipeline(
    ctx: &StreamContext,
    out_dir: &Path,
    shared: &SharedState,
) -> PipelineExit {
    if let Err(e) = tokio::fs::create_dir_all(out_dir).await {
        return PipelineExit::SpawnFailed(format!("creating {}: {e}", out_dir.display()));
    }

    let mut spawned =
        match muxer::spawn(&ctx.muxer_program, out_dir, ctx.segment_seconds) {
            Ok(spawned) => spawned,
            Err(e) => return PipelineExit::SpawnFailed(e.to_string()),
        };

    let stderr_task = tokio::spawn(muxer::read_stderr(
        spawned.stderr,
        ctx.stream_id.clone(),
        Arc::clone(shared),
    ));

    let consumer_stop = CancellationToken::new();
    let consumer_task = tokio::spawn(consumer::run(consumer::ConsumerContext {
        broker: Arc::clone(&ctx.broker),
        store: Arc::clone(&ctx.store),
        stream_id: ctx.stream_id.clone(),
        stdin: spawned.stdin,
        shared: Arc::clone(shared),
        draining: Arc::clone(&ctx.draining),
        stop: consumer_stop.clone(),
    }));

    let poller_stop = CancellationToken::new();
    let poller_task = tokio::spawn(uploader::poll_loop(uploader::UploaderContext {
        broker: Arc::clone(&ctx.broker),
        store: Arc::clone(&ctx.store),
        stream_id: ctx.stream_id.clone(),
        prefix: ctx.prefix.clone(),
        out_dir: out_dir.to_path_buf(),
        shared: Arc::clone(shared),
        stop: poller_stop.clone(),
    }));

    // The muxer exits on its own once the consumer closes its stdin; the
    // kill token covers muxers that refuse to drain.
    let graceful = tokio::select! {
        status = spawned.child.wait() => status.ok(),
        () = ctx.kill.cancelled() => None,
    };
    let status = if graceful.is_some() {
        graceful
    } else {
        warn!(stream_id = %ctx.stream_id, "Killing muxer after drain grace");
        let _ = spawned.child.start_kill();
        spawned.child.wait().await.ok()
    };

    // Exclusive-ownership handoff: the poller stops before the finalizer's
    // sweep; the consumer exits once it notices the closed pipe.
    consumer_stop.cancel();
    poller_stop.cancel();
    let _ = consumer_task.await;
    let _ = poller_task.await;
    let _ = stderr_task.await;

    PipelineExit::Muxer(status)
}

/// The finalizer: final sweep, terminal events, state transition, ownership
/// release, temp dir removal.
async fn finalize(
    ctx: &StreamContext,
    out_dir: &Path,
    shared: &SharedState,
    exit: &PipelineExit,
    metrics: &TranscodeMetrics,
) {
    // Final sweep with quiescence waived: segments first, then the frozen
    // manifest, so the terminal playlist only names uploaded segments.
    if let Err(e) = uploader::sweep(
        ctx.broker.as_ref(),
        ctx.store.as_ref(),
        &ctx.stream_id,
        &ctx.prefix,
        out_dir,
        shared,
        true,
    )
    .await
    {
        warn!(stream_id = %ctx.stream_id, error = %e, "Final output sweep failed");
    }

    let (segment_count, total_bytes, consumer_failure, muxer_errors) = {
        let state = lock_state(shared);
        (
            state.segment_count,
            state.total_bytes,
            state.failed.clone(),
            state.muxer_errors.iter().cloned().collect::<Vec<_>>(),
        )
    };

    let stream_status = current_status(ctx).await;
    let muxer_ok = matches!(exit, PipelineExit::Muxer(Some(status)) if status.success());

    // Non-zero muxer exit is fatal during Live; while Ending it is
    // tolerated as long as something was produced.
    let error_reason = if let Some(reason) = consumer_failure {
        Some(reason)
    } else if let PipelineExit::SpawnFailed(reason) = exit {
        Some(livereel_core::PipelineError::Muxer(reason.clone()).to_string())
    } else if !muxer_ok
        && (stream_status != Some(StreamStatus::Ending) || segment_count == 0)
    {
        let detail = muxer_errors.last().cloned().unwrap_or_else(|| "exited abnormally".to_string());
        Some(livereel_core::PipelineError::Muxer(detail).to_string())
    } else {
        None
    };

    let state_key = keys::state_key(&ctx.stream_id);
    if let Some(reason) = error_reason {
        error!(stream_id = %ctx.stream_id, reason = %reason, "Finalizing in error mode");
        publish_progress(
            ctx.broker.as_ref(),
            &ctx.stream_id,
            &ProgressEvent::StatusChange { status: TranscodeStatus::Error },
        )
        .await;
        publish_progress(
            ctx.broker.as_ref(),
            &ctx.stream_id,
            &ProgressEvent::StreamError { reason },
        )
        .await;
        set_status(ctx, &state_key, StreamStatus::Error).await;
    } else {
        info!(
            stream_id = %ctx.stream_id,
            segment_count,
            total_bytes,
            "Transcode complete"
        );
        metrics.segments_counter.add(segment_count, &[]);
        metrics.bytes_counter.add(total_bytes, &[]);
        // Consumers tolerate either ordering of this pair; keep it anyway.
        publish_progress(
            ctx.broker.as_ref(),
            &ctx.stream_id,
            &ProgressEvent::StatusChange { status: TranscodeStatus::Ready },
        )
        .await;
        publish_progress(
            ctx.broker.as_ref(),
            &ctx.stream_id,
            &ProgressEvent::StreamComplete { segment_count, total_bytes },
        )
        .await;
        set_status(ctx, &state_key, StreamStatus::Complete).await;
    }

    // Retain terminal state briefly for late status queries, then let it
    // expire; release ownership immediately.
    if let Err(e) = ctx.broker.expire(&state_key, COMPLETE_RETENTION).await {
        warn!(stream_id = %ctx.stream_id, error = %e, "Failed to schedule state retirement");
    }
    if let Err(e) = ctx.broker.del(&keys::owner_key(&ctx.stream_id)).await {
        warn!(stream_id = %ctx.stream_id, error = %e, "Failed to release ownership");
    }
    if let Err(e) = tokio::fs::remove_dir_all(out_dir).await {
        warn!(stream_id = %ctx.stream_id, error = %e, "Failed to remove temp dir");
    }
}

async fn current_status(ctx: &StreamContext) -> Option<StreamStatus> {
    ctx.broker
        .hash_get(&keys::state_key(&ctx.stream_id), "status")
        .await
        .ok()
        .flatten()
        .and_then(|raw| raw.parse().ok())
}

async fn set_status(ctx: &StreamContext, state_key: &str, status: StreamStatus) {
    if let Err(e) = ctx.broker.hash_set_field(state_key, "status", status.as_str()).await {
        warn!(stream_id = %ctx.stream_id, error = %e, "Failed to write terminal status");
    }
}
