// SPDX-FileCopyrightText: © 2025 Livereel Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Livereel Core - Shared data types and coordination contracts for the live
//! streaming ingest and transcode pipeline.
//!
//! ## Core Modules
//!
//! - [`types`]: Domain types (StreamStatus, StreamState, ChunkRecord, ...)
//! - [`keys`]: Bit-exact object-key layout and broker key names
//! - [`constants`]: Pipeline timing constants shared by gateway and worker
//! - [`error`]: Error taxonomy and handling

pub mod constants;
pub mod error;
pub mod keys;
pub mod types;

// Error handling
pub use error::PipelineError;

// Domain types
pub use types::{
    unix_ms_now, ChunkRecord, PauseEvent, StreamId, StreamState, StreamStats, StreamStatus,
    WorkerId,
};
