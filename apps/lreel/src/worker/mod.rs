// SPDX-FileCopyrightText: © 2025 Livereel Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Transcode worker: claims streams off the control log, drives one muxer
//! child per owned stream, uploads outputs, publishes progress.

pub mod heartbeat;
pub mod reclaim;
pub mod transcode;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use livereel_api::ControlEvent;
use livereel_broker::{Broker, Cursor};
use livereel_core::constants::{CONTROL_READ_TIMEOUT, MUXER_KILL_GRACE};
use livereel_core::{keys, StreamStatus};
use livereel_storage::ObjectStore;

use crate::backends;
use crate::config::Config;

/// What the follower keeps per owned stream. The task owns everything else;
/// external code holds only the signals.
struct StreamHandle {
    draining: Arc<AtomicBool>,
    kill: CancellationToken,
    join: JoinHandle<()>,
}

struct Worker {
    worker_id: String,
    broker: Arc<dyn Broker>,
    store: Arc<dyn ObjectStore>,
    config: Arc<Config>,
    active: HashMap<String, StreamHandle>,
}

/// Runs the worker until a shutdown signal.
///
/// # Errors
///
/// Returns an error if a backend cannot be constructed.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let broker = backends::build_broker(&config).await?;
    let store = backends::build_store(&config).await?;

    let worker_id = config.worker.resolved_worker_id();
    let heartbeat_interval = config.worker.resolved_heartbeat_interval();
    let heartbeat_ttl = config.worker.resolved_heartbeat_ttl();
    if heartbeat_ttl <= heartbeat_interval * 2 {
        warn!(
            interval_ms = heartbeat_interval.as_millis() as u64,
            ttl_ms = heartbeat_ttl.as_millis() as u64,
            "Heartbeat TTL should exceed 2x the refresh interval"
        );
    }

    info!(worker_id = %worker_id, "Worker starting");

    let heartbeat_stop = CancellationToken::new();
    let heartbeat_task = tokio::spawn(heartbeat::run(
        Arc::clone(&broker),
        worker_id.clone(),
        heartbeat_interval,
        heartbeat_ttl,
        heartbeat_stop.clone(),
    ));

    let mut worker = Worker {
        worker_id,
        broker,
        store,
        config: Arc::new(config),
        active: HashMap::new(),
    };

    // Heal streams stranded by dead workers before following new work.
    for orphan in reclaim::sweep(&worker.broker, &worker.worker_id).await {
        let draining = orphan.state.status == StreamStatus::Ending;
        worker.spawn_stream(&orphan.stream_id, &orphan.state.prefix, draining);
    }

    let shutdown = shutdown_token();
    worker.follow_control(&shutdown).await;

    // Drain every owned stream, give muxers a grace window, then force.
    worker.shutdown().await;

    // Heartbeats stop last so peers do not start reclaiming mid-drain.
    heartbeat_stop.cancel();
    let _ = heartbeat_task.await;

    info!("Worker stopped");
    Ok(())
}

fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let signal_token = token.clone();
    tokio::spawn(async move {
        let ctrl_c = async {
            let _ = tokio::signal::ctrl_c().await;
        };

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                },
                Err(e) => warn!(error = %e, "Failed to install SIGTERM handler"),
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            () = ctrl_c => {},
            () = terminate => {},
        }
        info!("Shutdown signal received");
        signal_token.cancel();
    });
    token
}

impl Worker {
    /// Tails the control log from "new entries only" until shutdown. The
    /// blocking budget bounds how stale the shutdown check can get.
    async fn follow_control(&mut self, shutdown: &CancellationToken) {
        let mut cursor = match self.broker.log_last_id(keys::CONTROL_LOG).await {
            Ok(Some(id)) => Cursor::After(id),
            Ok(None) => Cursor::Start,
            Err(e) => {
                warn!(error = %e, "Could not resolve control log tail; reading from start");
                Cursor::Start
            },
        };

        while !shutdown.is_cancelled() {
            let entries = match self
                .broker
                .log_read(keys::CONTROL_LOG, &cursor, Some(CONTROL_READ_TIMEOUT))
                .await
            {
                Ok(entries) => entries,
                Err(e) => {
                    warn!(error = %e, "Control log read failed");
                    tokio::time::sleep(Duration::from_millis(500)).await;
                    continue;
                },
            };

            if let Some(last) = entries.last() {
                cursor = Cursor::After(last.id.clone());
            }

            for entry in entries {
                match serde_json::from_str::<ControlEvent>(&entry.payload) {
                    Ok(event) => self.handle_control_event(event).await,
                    Err(e) => {
                        warn!(error = %e, "Dropping malformed control event");
                    },
                }
            }

            self.reap_finished();
        }
    }

    async fn handle_control_event(&mut self, event: ControlEvent) {
        match event {
            ControlEvent::StreamStart { stream_id, bucket: _, prefix } => {
                self.try_claim(&stream_id, &prefix).await;
            },
            ControlEvent::StreamStop { stream_id, .. } => {
                if let Some(handle) = self.active.get(&stream_id) {
                    info!(stream_id = %stream_id, "Stream stopping; draining");
                    handle.draining.store(true, Ordering::Relaxed);
                } else {
                    debug!(stream_id = %stream_id, "Stop for stream we do not own; ignoring");
                }
            },
        }
    }

    /// Set-if-absent claim; exactly one worker wins each stream.
    async fn try_claim(&mut self, stream_id: &str, prefix: &str) {
        if self.active.contains_key(stream_id) {
            // Re-announced start for a stream we already own (recorder
            // re-attachment); the running task keeps going.
            debug!(stream_id = %stream_id, "Start for stream already owned; ignoring");
            return;
        }

        let claimed = match self
            .broker
            .set_nx(&keys::owner_key(stream_id), &self.worker_id, None)
            .await
        {
            Ok(claimed) => claimed,
            Err(e) => {
                warn!(stream_id = %stream_id, error = %e, "Ownership claim failed");
                return;
            },
        };

        if !claimed {
            info!(stream_id = %stream_id, "Claim skipped; another worker owns the stream");
            return;
        }

        info!(stream_id = %stream_id, worker_id = %self.worker_id, "Claimed stream");
        self.spawn_stream(stream_id, prefix, false);
    }

    fn spawn_stream(&mut self, stream_id: &str, prefix: &str, draining: bool) {
        let draining = Arc::new(AtomicBool::new(draining));
        let kill = CancellationToken::new();

        let ctx = transcode::StreamContext {
            stream_id: stream_id.to_string(),
            prefix: prefix.to_string(),
            worker_id: self.worker_id.clone(),
            broker: Arc::clone(&self.broker),
            store: Arc::clone(&self.store),
            muxer_program: self.config.worker.muxer_program.clone(),
            segment_seconds: self.config.worker.segment_seconds,
            temp_root: PathBuf::from(&self.config.worker.temp_root),
            draining: Arc::clone(&draining),
            kill: kill.clone(),
        };

        let join = tokio::spawn(transcode::run(ctx));
        self.active.insert(stream_id.to_string(), StreamHandle { draining, kill, join });
    }

    fn reap_finished(&mut self) {
        self.active.retain(|stream_id, handle| {
            if handle.join.is_finished() {
                debug!(stream_id = %stream_id, "Stream task retired");
                false
            } else {
                true
            }
        });
    }

    /// Drain, wait for graceful muxer exits, SIGKILL stragglers, then let
    /// every finalizer run to completion (best effort on uploads).
    async fn shutdown(&mut self) {
        if self.active.is_empty() {
            return;
        }
        info!(streams = self.active.len(), "Draining owned streams for shutdown");

        for handle in self.active.values() {
            handle.draining.store(true, Ordering::Relaxed);
        }

        let grace = tokio::time::sleep(MUXER_KILL_GRACE);
        tokio::pin!(grace);
        loop {
            self.reap_finished();
            if self.active.is_empty() {
                return;
            }
            tokio::select! {
                () = &mut grace => break,
                () = tokio::time::sleep(Duration::from_millis(100)) => {}
            }
        }

        warn!(streams = self.active.len(), "Muxers still alive after grace; killing");
        for handle in self.active.values() {
            handle.kill.cancel();
        }
        for (stream_id, handle) in self.active.drain() {
            if handle.join.await.is_err() {
                warn!(stream_id = %stream_id, "Stream task panicked during shutdown");
            }
        }
    }
}
