// SPDX-FileCopyrightText: © 2025 Livereel Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Ingest gateway: terminates recorder websocket connections, persists media
//! chunks, announces lifecycle events on the control log, and relays
//! transcoder progress to viewers.

pub mod events;
pub mod server;
pub mod state;
pub mod streams;
pub mod websocket;

use std::sync::Arc;

use crate::backends;
use crate::config::Config;

/// Builds the backends from configuration and serves until shutdown.
///
/// # Errors
///
/// Returns an error if a backend cannot be constructed or the listen address
/// cannot be bound.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let broker = backends::build_broker(&config).await?;
    let store = backends::build_store(&config).await?;
    let records = backends::build_records(&config).await?;

    let app_state = Arc::new(state::AppState::new(config, broker, store, records));

    // The relay is the single broker subscriber for this process; every
    // websocket connection holds its own receiver on the in-process channel.
    tokio::spawn(events::run_event_relay(Arc::clone(&app_state)));

    server::serve(app_state).await
}
