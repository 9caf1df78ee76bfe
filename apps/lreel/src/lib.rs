// SPDX-FileCopyrightText: © 2025 Livereel Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Livereel server library.
//!
//! The `lreel` binary runs one of two roles against a shared coordination
//! broker and object store:
//!
//! - [`gateway`]: terminates recorder websocket connections, persists media
//!   chunks, announces lifecycle events, and relays transcoder progress to
//!   viewers;
//! - [`worker`]: claims streams from the control log, drives a muxer child
//!   process per stream, and uploads HLS segments and manifests.
//!
//! The library exists so integration tests can compose the same router and
//! worker loops against in-memory backends.

pub mod backends;
pub mod cli;
pub mod config;
pub mod gateway;
pub mod logging;
pub mod telemetry;
pub mod worker;

pub use config::Config;
