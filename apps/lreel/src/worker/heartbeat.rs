// SPDX-FileCopyrightText: © 2025 Livereel Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! worker/heartbeat.rs: The liveness key keeper.
//!
//! Refreshes `heartbeat:{worker}` with a TTL on a fixed cadence. Broker
//! failures are retried forever with capped backoff: a worker that cannot
//! heartbeat will eventually lose its streams to the reclaim sweep, so
//! giving up here would only make that certain.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use livereel_broker::Broker;
use livereel_core::{keys, unix_ms_now};

const BACKOFF_BASE: Duration = Duration::from_millis(250);
const BACKOFF_CAP: Duration = Duration::from_secs(5);

pub async fn run(
    broker: Arc<dyn Broker>,
    worker_id: String,
    interval: Duration,
    ttl: Duration,
    stop: CancellationToken,
) {
    let key = keys::heartbeat_key(&worker_id);
    let mut failures: u32 = 0;

    loop {
        let delay = match broker.set(&key, &unix_ms_now().to_string(), Some(ttl)).await {
            Ok(()) => {
                if failures > 0 {
                    debug!(worker_id = %worker_id, "Heartbeat recovered");
                }
                failures = 0;
                interval
            },
            Err(e) => {
                failures = failures.saturating_add(1);
                warn!(worker_id = %worker_id, error = %e, failures, "Heartbeat refresh failed");
                BACKOFF_CAP.min(BACKOFF_BASE * 2_u32.pow(failures.min(8)))
            },
        };

        tokio::select! {
            () = stop.cancelled() => break,
            () = tokio::time::sleep(delay) => {}
        }
    }

    // Dropping the key promptly lets peers reclaim without waiting for the
    // TTL. Best effort: the TTL covers the failure case.
    if let Err(e) = broker.del(&key).await {
        warn!(worker_id = %worker_id, error = %e, "Failed to drop heartbeat key on shutdown");
    }
}
