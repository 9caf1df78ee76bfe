// SPDX-FileCopyrightText: © 2025 Livereel Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! worker/transcode/consumer.rs: The chunk consumer.
//!
//! Tails the stream's chunk log, fetches each committed chunk from object
//! storage, and writes the bytes to the muxer's stdin in strictly increasing
//! sequence order. Entries arriving out of order are buffered; a gap during
//! Live is waited out indefinitely, a gap persisting past the drain grace
//! after Ending is abandoned.
//!
//! The muxer's stdin is owned exclusively by this task; dropping it on exit
//! is what lets the muxer flush and finish.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::process::ChildStdin;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use livereel_broker::{Broker, Cursor};
use livereel_core::constants::{
    DRAIN_GRACE, READ_TIMEOUT, STORAGE_BACKOFF_BASE, STORAGE_GET_ATTEMPTS,
};
use livereel_core::{keys, ChunkRecord, PipelineError, StreamStatus};
use livereel_storage::ObjectStore;

use super::{lock_state, SharedState};

/// Consecutive broker read failures tolerated before the task fails.
const BROKER_READ_ATTEMPTS: u32 = 3;

pub struct ConsumerContext {
    pub broker: Arc<dyn Broker>,
    pub store: Arc<dyn ObjectStore>,
    pub stream_id: String,
    pub stdin: ChildStdin,
    pub shared: SharedState,
    pub draining: Arc<AtomicBool>,
    pub stop: CancellationToken,
}

fn record_failure(shared: &SharedState, reason: String) {
    lock_state(shared).failed = Some(reason);
}

async fn fetch_with_retry(
    store: &dyn ObjectStore,
    key: &str,
) -> Result<Bytes, livereel_storage::StorageError> {
    let mut attempt = 0;
    loop {
        match store.get(key).await {
            Ok(bytes) => return Ok(bytes),
            Err(e) if attempt + 1 < STORAGE_GET_ATTEMPTS => {
                attempt += 1;
                warn!(key = %key, attempt, error = %e, "Chunk fetch failed; backing off");
                tokio::time::sleep(STORAGE_BACKOFF_BASE * 2_u32.pow(attempt - 1)).await;
            },
            Err(e) => return Err(e),
        }
    }
}

/// Runs until the log is drained, the muxer goes away, a fatal storage
/// failure, or cancellation. Closing the returned-stdin-by-drop is the
/// drain signal for the muxer.
#[allow(clippy::too_many_lines, clippy::cognitive_complexity)]
pub async fn run(ctx: ConsumerContext) {
    let ConsumerContext { broker, store, stream_id, mut stdin, shared, draining, stop } = ctx;
    let log = keys::chunk_log(&stream_id);

    let mut cursor = Cursor::Start;
    let mut pending: BTreeMap<u64, ChunkRecord> = BTreeMap::new();
    let mut last_applied: Option<u64> = None;
    let mut broker_failures: u32 = 0;
    // One extra blocking read is allowed for a gap discovered while
    // draining, then the gap is abandoned.
    let mut drain_grace_spent = false;

    loop {
        if stop.is_cancelled() {
            break;
        }

        let draining_now = draining.load(Ordering::Relaxed);
        // Draining switches to non-blocking reads; the single grace read for
        // an open gap happens separately below.
        let block = if draining_now { None } else { Some(READ_TIMEOUT) };

        let entries = match broker.log_read(&log, &cursor, block).await {
            Ok(entries) => {
                broker_failures = 0;
                entries
            },
            Err(e) => {
                broker_failures += 1;
                warn!(stream_id = %stream_id, error = %e, broker_failures, "Chunk log read failed");
                if broker_failures >= BROKER_READ_ATTEMPTS {
                    record_failure(
                        &shared,
                        PipelineError::Broker(format!("chunk log unavailable: {e}")).to_string(),
                    );
                    break;
                }
                tokio::time::sleep(STORAGE_BACKOFF_BASE * 2_u32.pow(broker_failures - 1)).await;
                continue;
            },
        };

        let got_new = !entries.is_empty();
        if let Some(last) = entries.last() {
            cursor = Cursor::After(last.id.clone());
        }

        for entry in entries {
            match serde_json::from_str::<ChunkRecord>(&entry.payload) {
                Ok(record) => {
                    if last_applied.is_some_and(|applied| record.seq <= applied) {
                        warn!(
                            stream_id = %stream_id,
                            seq = record.seq,
                            "Rejecting out-of-order chunk entry"
                        );
                        continue;
                    }
                    pending.insert(record.seq, record);
                },
                Err(e) => {
                    warn!(stream_id = %stream_id, error = %e, "Dropping malformed chunk entry");
                },
            }
        }

        // Apply the dense in-order prefix.
        let mut write_failed = false;
        loop {
            let expected = last_applied.map_or(0, |applied| applied + 1);
            let Some(record) = pending.remove(&expected) else {
                break;
            };

            let bytes = match fetch_with_retry(store.as_ref(), &record.key).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    record_failure(
                        &shared,
                        PipelineError::Storage(format!(
                            "chunk {expected} fetch failed after retries: {e}"
                        ))
                        .to_string(),
                    );
                    return;
                },
            };

            if let Err(e) = stdin.write_all(&bytes).await {
                // The muxer went away; the driver will observe its exit.
                info!(stream_id = %stream_id, seq = expected, error = %e, "Muxer stdin closed");
                write_failed = true;
                break;
            }

            debug!(stream_id = %stream_id, seq = expected, size = record.size, "Chunk applied");
            last_applied = Some(expected);
            lock_state(&shared).last_applied_seq = last_applied;
        }
        if write_failed {
            break;
        }

        if draining_now {
            if pending.is_empty() && !got_new {
                info!(stream_id = %stream_id, last_applied = ?last_applied, "Chunk log drained");
                break;
            }
            if !pending.is_empty() && !got_new {
                if drain_grace_spent {
                    let gap = PipelineError::Sequence(format!(
                        "gap after {last_applied:?} persisted past drain grace; abandoning {} buffered chunks",
                        pending.len()
                    ));
                    warn!(stream_id = %stream_id, error = %gap, "Finalizing with applied prefix");
                    break;
                }
                // One read cycle of grace for the missing sequence number.
                drain_grace_spent = true;
                match broker.log_read(&log, &cursor, Some(DRAIN_GRACE)).await {
                    Ok(grace_entries) if !grace_entries.is_empty() => {
                        drain_grace_spent = false;
                        if let Some(last) = grace_entries.last() {
                            cursor = Cursor::After(last.id.clone());
                        }
                        for entry in grace_entries {
                            if let Ok(record) =
                                serde_json::from_str::<ChunkRecord>(&entry.payload)
                            {
                                if !last_applied.is_some_and(|applied| record.seq <= applied) {
                                    pending.insert(record.seq, record);
                                }
                            }
                        }
                    },
                    Ok(_) => {},
                    Err(e) => {
                        warn!(stream_id = %stream_id, error = %e, "Grace read failed");
                    },
                }
            }
        } else if !got_new {
            // Idle Live cycle: re-check stream state. Covers reclaimed
            // streams whose StreamStop predates our control cursor.
            let status = broker
                .hash_get(&keys::state_key(&stream_id), "status")
                .await
                .ok()
                .flatten()
                .and_then(|raw| raw.parse::<StreamStatus>().ok());
            if status == Some(StreamStatus::Ending) {
                debug!(stream_id = %stream_id, "Stream state is Ending; entering drain");
                draining.store(true, Ordering::Relaxed);
            }
        }
    }

    // Dropping stdin closes the pipe; the muxer flushes its last segment,
    // appends the terminal marker to the manifest, and exits.
    drop(stdin);
}
