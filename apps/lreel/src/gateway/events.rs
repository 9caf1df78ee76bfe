// SPDX-FileCopyrightText: © 2025 Livereel Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! gateway/events.rs: The single broker subscriber for this process.
//!
//! Drains the per-stream progress channels and forwards every event on the
//! in-process broadcast channel; each websocket connection holds its own
//! receiver. Terminal events additionally drive idempotent recording-record
//! updates.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use livereel_api::{ProgressEvent, TranscodeStatus};
use livereel_core::{keys, unix_ms_now};

use crate::gateway::state::AppState;

const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(1);

/// Runs until the process exits, resubscribing on broker hiccups.
pub async fn run_event_relay(state: Arc<AppState>) {
    loop {
        let mut subscription = match state.broker.subscribe(keys::EVENTS_PATTERN).await {
            Ok(subscription) => subscription,
            Err(e) => {
                warn!(error = %e, "Progress event subscription failed; retrying");
                tokio::time::sleep(RESUBSCRIBE_DELAY).await;
                continue;
            },
        };
        info!(pattern = %keys::EVENTS_PATTERN, "Subscribed to progress events");

        while let Some((channel, payload)) = subscription.next().await {
            let Some(stream_id) = keys::stream_of_events_channel(&channel) else {
                continue;
            };
            let event: ProgressEvent = match serde_json::from_str(&payload) {
                Ok(event) => event,
                Err(e) => {
                    warn!(channel = %channel, error = %e, "Dropping malformed progress event");
                    continue;
                },
            };

            debug!(stream_id = %stream_id, event = ?event, "Relaying progress event");
            apply_record_updates(&state, stream_id, &event).await;

            // send() errs when no connection is subscribed, which is fine -
            // viewers may connect later.
            let _ = state.event_tx.send(event.into_server_frame(stream_id));
        }

        warn!("Progress event subscription ended; resubscribing");
        tokio::time::sleep(RESUBSCRIBE_DELAY).await;
    }
}

/// Mirrors terminal progress onto the recording record. All updates are
/// narrow and idempotent; failures are logged and the relay keeps going.
async fn apply_record_updates(state: &AppState, stream_id: &str, event: &ProgressEvent) {
    let result = match event {
        ProgressEvent::StatusChange { status } => {
            let record_status = match status {
                TranscodeStatus::Transcoding => "processing",
                TranscodeStatus::Ready => "ready",
                TranscodeStatus::Error => "error",
            };
            state.records.set_status(stream_id, record_status).await
        },
        ProgressEvent::StreamComplete { total_bytes, .. } => {
            match state.records.set_file_bytes(stream_id, *total_bytes).await {
                Ok(()) => state.records.clear_live(stream_id, unix_ms_now()).await,
                Err(e) => Err(e),
            }
        },
        ProgressEvent::StreamError { .. } => {
            match state.records.set_status(stream_id, "error").await {
                Ok(()) => state.records.clear_live(stream_id, unix_ms_now()).await,
                Err(e) => Err(e),
            }
        },
        ProgressEvent::SegmentReady { .. } | ProgressEvent::ManifestUpdated { .. } => Ok(()),
    };

    if let Err(e) = result {
        warn!(stream_id = %stream_id, error = %e, "Recording record update failed");
    }
}
