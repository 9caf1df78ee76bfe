// SPDX-FileCopyrightText: © 2025 Livereel Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! worker/transcode/uploader.rs: The output poller.
//!
//! Polls the muxer's output directory, uploading segments that have
//! quiesced and the manifest whenever its mtime changes. Within each cycle
//! every `.ts` entry is processed before `stream.m3u8`, so an uploaded
//! manifest revision only ever names already-uploaded segments. Upload
//! failures leave the file unmarked and are retried on the next cycle.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use livereel_api::ProgressEvent;
use livereel_broker::Broker;
use livereel_core::constants::{MANIFEST_SETTLE, POLL_INTERVAL, QUIESCENCE};
use livereel_core::keys;
use livereel_storage::ObjectStore;

use super::{lock_state, publish_progress, SharedState};

const SEGMENT_CONTENT_TYPE: &str = "video/mp2t";
const MANIFEST_CONTENT_TYPE: &str = "application/vnd.apple.mpegurl";
const MANIFEST_CACHE_CONTROL: &str = "no-cache, no-store, must-revalidate";

pub struct UploaderContext {
    pub broker: Arc<dyn Broker>,
    pub store: Arc<dyn ObjectStore>,
    pub stream_id: String,
    pub prefix: String,
    pub out_dir: PathBuf,
    pub shared: SharedState,
    pub stop: CancellationToken,
}

/// Polls until cancelled. The finalizer runs its own final sweep after this
/// task has stopped; the two never touch the directory concurrently.
pub async fn poll_loop(ctx: UploaderContext) {
    let mut ticker = tokio::time::interval(POLL_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = ctx.stop.cancelled() => break,
            _ = ticker.tick() => {}
        }

        if let Err(e) = sweep(
            ctx.broker.as_ref(),
            ctx.store.as_ref(),
            &ctx.stream_id,
            &ctx.prefix,
            &ctx.out_dir,
            &ctx.shared,
            false,
        )
        .await
        {
            warn!(stream_id = %ctx.stream_id, error = %e, "Output poll failed");
        }
    }
}

/// One pass over the output directory. With `final_pass` the quiescence
/// window is waived and the manifest is uploaded unconditionally.
#[allow(clippy::too_many_arguments, clippy::cognitive_complexity)]
pub async fn sweep(
    broker: &dyn Broker,
    store: &dyn ObjectStore,
    stream_id: &str,
    prefix: &str,
    out_dir: &Path,
    shared: &SharedState,
    final_pass: bool,
) -> std::io::Result<()> {
    let mut names: Vec<String> = Vec::new();
    let mut entries = tokio::fs::read_dir(out_dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        if let Some(name) = entry.file_name().to_str() {
            names.push(name.to_string());
        }
    }
    // Discovery order is not sequence order; the manifest is the source of
    // truth for playback order, so lexicographic is only for determinism.
    names.sort_unstable();

    let now = SystemTime::now();

    for name in names.iter().filter(|name| name.ends_with(".ts")) {
        if !keys::is_safe_segment_name(name) {
            warn!(stream_id = %stream_id, name = %name, "Skipping unsafe segment name");
            continue;
        }
        if lock_state(shared).uploaded.contains(name) {
            continue;
        }

        let path = out_dir.join(name);
        let metadata = match tokio::fs::metadata(&path).await {
            Ok(metadata) => metadata,
            Err(e) => {
                debug!(stream_id = %stream_id, name = %name, error = %e, "Segment vanished mid-poll");
                continue;
            },
        };

        if !final_pass {
            let stable = metadata
                .modified()
                .ok()
                .and_then(|mtime| now.duration_since(mtime).ok())
                .is_some_and(|age| age >= QUIESCENCE);
            if !stable {
                // Still being written; it will quiesce by a later cycle.
                continue;
            }
        }

        let key = keys::hls_key(prefix, stream_id, name);
        match store.put_file(&key, &path, SEGMENT_CONTENT_TYPE, None).await {
            Ok(()) => {
                let size = metadata.len();
                {
                    let mut state = lock_state(shared);
                    // Guard against double-publishing on finalizer overlap.
                    if !state.uploaded.insert(name.clone()) {
                        continue;
                    }
                    state.segment_count += 1;
                    state.total_bytes += size;
                }
                info!(stream_id = %stream_id, name = %name, size, "Segment uploaded");
                publish_progress(
                    broker,
                    stream_id,
                    &ProgressEvent::SegmentReady { name: name.clone(), size },
                )
                .await;
            },
            Err(e) => {
                // Not marked; retried next cycle.
                warn!(stream_id = %stream_id, name = %name, error = %e, "Segment upload failed");
            },
        }
    }

    upload_manifest_if_changed(broker, store, stream_id, prefix, out_dir, shared, final_pass)
        .await;

    Ok(())
}

/// The manifest goes last within the cycle. Its mtime is the change signal;
/// a short settle pause lets an in-progress rewrite complete.
async fn upload_manifest_if_changed(
    broker: &dyn Broker,
    store: &dyn ObjectStore,
    stream_id: &str,
    prefix: &str,
    out_dir: &Path,
    shared: &SharedState,
    final_pass: bool,
) {
    let path = out_dir.join(keys::MANIFEST_NAME);
    let Ok(metadata) = tokio::fs::metadata(&path).await else {
        return;
    };
    let mtime = metadata.modified().ok();

    if !final_pass {
        let unchanged = {
            let state = lock_state(shared);
            mtime.is_some() && state.last_manifest_mtime == mtime
        };
        if unchanged {
            return;
        }
        tokio::time::sleep(MANIFEST_SETTLE).await;
    }

    let key = keys::manifest_key(prefix, stream_id);
    match store
        .put_file(&key, &path, MANIFEST_CONTENT_TYPE, Some(MANIFEST_CACHE_CONTROL))
        .await
    {
        Ok(()) => {
            lock_state(shared).last_manifest_mtime = mtime;
            debug!(stream_id = %stream_id, key = %key, "Manifest uploaded");
            publish_progress(broker, stream_id, &ProgressEvent::ManifestUpdated { key }).await;
        },
        Err(e) => {
            warn!(stream_id = %stream_id, error = %e, "Manifest upload failed");
        },
    }
}
