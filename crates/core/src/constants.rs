// SPDX-FileCopyrightText: © 2025 Livereel Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Pipeline timing constants shared by the gateway and the worker.
//!
//! Values are defaults; the worker's heartbeat cadence can be overridden via
//! configuration, with the invariant that TTL > 2x the refresh interval.

use std::time::Duration;

/// Target duration of each HLS segment produced by the muxer.
pub const SEGMENT_DURATION_SECS: u32 = 4;

/// Cadence at which a worker refreshes its liveness key.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(5_000);

/// TTL on the liveness key. Must exceed 2x [`HEARTBEAT_INTERVAL`].
pub const HEARTBEAT_TTL: Duration = Duration::from_millis(10_000);

/// Cadence of the output-directory poller.
pub const POLL_INTERVAL: Duration = Duration::from_millis(1_000);

/// How long a segment file must be unmodified before it is uploaded.
pub const QUIESCENCE: Duration = Duration::from_millis(500);

/// Blocking budget for each chunk-log read cycle.
pub const READ_TIMEOUT: Duration = Duration::from_millis(500);

/// After `Ending`, how long the consumer waits on a sequence gap before it
/// finalizes with whatever was applied. One read cycle.
pub const DRAIN_GRACE: Duration = READ_TIMEOUT;

/// Pause before uploading a manifest whose mtime changed, so a rewrite in
/// progress can settle.
pub const MANIFEST_SETTLE: Duration = Duration::from_millis(100);

/// Blocking budget for each control-log read cycle.
pub const CONTROL_READ_TIMEOUT: Duration = Duration::from_millis(1_000);

/// How long the stream state hash is retained after reaching a terminal
/// status, to permit late status queries.
pub const COMPLETE_RETENTION: Duration = Duration::from_secs(300);

/// Attempts for an object GET during chunk consumption.
pub const STORAGE_GET_ATTEMPTS: u32 = 3;

/// Base delay of the exponential backoff between GET attempts.
pub const STORAGE_BACKOFF_BASE: Duration = Duration::from_millis(100);

/// Grace period between closing the muxer's stdin on shutdown and SIGKILL.
pub const MUXER_KILL_GRACE: Duration = Duration::from_secs(2);
