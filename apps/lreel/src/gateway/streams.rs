// SPDX-FileCopyrightText: © 2025 Livereel Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! gateway/streams.rs: Tracks which streams have a live recorder connection.
//!
//! The per-connection sequencing state lives with the connection; the
//! manager only arbitrates "at most one recorder per stream" and feeds the
//! connection metrics. External code holds only the stream id.

use opentelemetry::global;
use std::collections::HashMap;

use livereel_core::StreamId;

struct ActiveStream {
    started_at_ms: i64,
}

/// A thread-safe registry of streams with an attached recorder.
pub struct StreamManager {
    active: HashMap<StreamId, ActiveStream>,
    // Metrics
    streams_active_gauge: opentelemetry::metrics::Gauge<u64>,
    streams_started_counter: opentelemetry::metrics::Counter<u64>,
    streams_detached_counter: opentelemetry::metrics::Counter<u64>,
}

impl Default for StreamManager {
    fn default() -> Self {
        let meter = global::meter("lreel_gateway_streams");
        Self {
            active: HashMap::new(),
            streams_active_gauge: meter
                .u64_gauge("streams.active")
                .with_description("Number of streams with an attached recorder")
                .build(),
            streams_started_counter: meter
                .u64_counter("streams.started")
                .with_description("Total number of streams started")
                .build(),
            streams_detached_counter: meter
                .u64_counter("streams.detached")
                .with_description("Total number of recorder detachments")
                .build(),
        }
    }
}

impl StreamManager {
    /// Registers a recorder for a stream. Returns `false` when another
    /// recorder already holds it.
    pub fn attach(&mut self, stream_id: &str, started_at_ms: i64) -> bool {
        if self.active.contains_key(stream_id) {
            return false;
        }
        self.active.insert(stream_id.to_string(), ActiveStream { started_at_ms });

        self.streams_started_counter.add(1, &[]);
        self.streams_active_gauge.record(self.active.len() as u64, &[]);
        true
    }

    /// Removes the recorder registration. Idempotent.
    pub fn detach(&mut self, stream_id: &str) {
        if self.active.remove(stream_id).is_some() {
            self.streams_detached_counter.add(1, &[]);
            self.streams_active_gauge.record(self.active.len() as u64, &[]);
        }
    }

    pub fn is_attached(&self, stream_id: &str) -> bool {
        self.active.contains_key(stream_id)
    }

    pub fn started_at_ms(&self, stream_id: &str) -> Option<i64> {
        self.active.get(stream_id).map(|stream| stream.started_at_ms)
    }

    pub fn count(&self) -> usize {
        self.active.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attach_is_exclusive_per_stream() {
        let mut manager = StreamManager::default();
        assert!(manager.attach("s1", 1_000));
        assert!(!manager.attach("s1", 2_000));
        assert!(manager.attach("s2", 3_000));
        assert_eq!(manager.count(), 2);
        assert_eq!(manager.started_at_ms("s1"), Some(1_000));

        manager.detach("s1");
        manager.detach("s1");
        assert!(!manager.is_attached("s1"));
        assert!(manager.attach("s1", 4_000));
    }
}
