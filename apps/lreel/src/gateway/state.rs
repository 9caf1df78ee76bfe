// SPDX-FileCopyrightText: © 2025 Livereel Contributors
//
// SPDX-License-Identifier: MPL-2.0

use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};

use livereel_api::ServerFrame;
use livereel_broker::Broker;
use livereel_records::RecordingStore;
use livereel_storage::ObjectStore;

use crate::config::Config;
use crate::gateway::streams::StreamManager;

/// Capacity of the in-process broadcast channel carrying progress frames to
/// websocket connections. Slow viewers lag and drop rather than backpressure
/// the relay.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub broker: Arc<dyn Broker>,
    pub store: Arc<dyn ObjectStore>,
    pub records: Arc<dyn RecordingStore>,
    pub streams: Arc<Mutex<StreamManager>>,
    pub event_tx: broadcast::Sender<ServerFrame>,
}

impl AppState {
    pub fn new(
        config: Config,
        broker: Arc<dyn Broker>,
        store: Arc<dyn ObjectStore>,
        records: Arc<dyn RecordingStore>,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            config: Arc::new(config),
            broker,
            store,
            records,
            streams: Arc::new(Mutex::new(StreamManager::default())),
            event_tx,
        }
    }
}
