// SPDX-FileCopyrightText: © 2025 Livereel Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! worker/reclaim.rs: The startup reclaim sweep.
//!
//! A crashed worker leaves its ownership keys behind; its heartbeat key
//! expires on its own. This sweep is the only healing path: on startup,
//! every owner key whose worker has no live heartbeat and whose stream is
//! still in a reclaimable state is rewritten to this worker.
//!
//! The adopted stream is re-transcoded from sequence 0: the dead worker's
//! temp directory is gone, so the muxer needs the full byte stream again.
//! Segment re-uploads are idempotent overwrites.

use std::sync::Arc;

use tracing::{info, warn};

use livereel_broker::Broker;
use livereel_core::{keys, StreamState};

/// A stream adopted from a dead worker.
pub struct ReclaimedStream {
    pub stream_id: String,
    pub state: StreamState,
}

pub async fn sweep(broker: &Arc<dyn Broker>, worker_id: &str) -> Vec<ReclaimedStream> {
    let owner_keys = match broker.keys(keys::OWNER_PATTERN).await {
        Ok(keys) => keys,
        Err(e) => {
            warn!(error = %e, "Reclaim sweep could not list ownership keys");
            return Vec::new();
        },
    };

    let mut reclaimed = Vec::new();

    for owner_key in owner_keys {
        let Some(stream_id) = keys::stream_of_owner_key(&owner_key) else {
            continue;
        };

        let owner = match broker.get(&owner_key).await {
            Ok(Some(owner)) => owner,
            Ok(None) => continue, // released in the meantime
            Err(e) => {
                warn!(stream_id = %stream_id, error = %e, "Reclaim owner read failed");
                continue;
            },
        };

        if owner == worker_id {
            // Leftover from an unclean restart of this very worker id.
            info!(stream_id = %stream_id, "Re-adopting own stale claim");
        } else {
            match broker.get(&keys::heartbeat_key(&owner)).await {
                Ok(Some(_)) => continue, // owner is alive
                Ok(None) => {},
                Err(e) => {
                    warn!(stream_id = %stream_id, error = %e, "Reclaim heartbeat read failed");
                    continue;
                },
            }
        }

        let state = match broker.hash_get_all(&keys::state_key(stream_id)).await {
            Ok(fields) if !fields.is_empty() => match StreamState::from_fields(&fields) {
                Ok(state) => state,
                Err(e) => {
                    warn!(stream_id = %stream_id, error = %e, "Reclaim state unreadable");
                    continue;
                },
            },
            Ok(_) => {
                // State already retired; drop the stale claim.
                let _ = broker.del(&owner_key).await;
                continue;
            },
            Err(e) => {
                warn!(stream_id = %stream_id, error = %e, "Reclaim state read failed");
                continue;
            },
        };

        if !state.status.is_reclaimable() {
            let _ = broker.del(&owner_key).await;
            continue;
        }

        if let Err(e) = broker.set(&owner_key, worker_id, None).await {
            warn!(stream_id = %stream_id, error = %e, "Reclaim ownership rewrite failed");
            continue;
        }

        info!(
            stream_id = %stream_id,
            previous_owner = %owner,
            status = %state.status,
            chunk_count = state.chunk_count,
            "Reclaimed orphaned stream"
        );
        reclaimed.push(ReclaimedStream { stream_id: stream_id.to_string(), state });
    }

    reclaimed
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use livereel_broker::MemoryBroker;
    use livereel_core::StreamStatus;

    async fn seed_stream(broker: &MemoryBroker, stream_id: &str, owner: &str) {
        let state = StreamState::new("media", "recordings/2026/08/01", 1_000);
        broker
            .hash_set(&keys::state_key(stream_id), &state.to_fields())
            .await
            .unwrap();
        broker.set(&keys::owner_key(stream_id), owner, None).await.unwrap();
    }

    #[tokio::test]
    async fn reclaims_only_streams_of_dead_workers() {
        let broker = MemoryBroker::new();
        seed_stream(&broker, "dead-stream", "w-dead").await;
        seed_stream(&broker, "live-stream", "w-alive").await;
        broker
            .set(&keys::heartbeat_key("w-alive"), "1", None)
            .await
            .unwrap();

        let broker_dyn: Arc<dyn Broker> = broker.clone();
        let reclaimed = sweep(&broker_dyn, "w-new").await;

        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].stream_id, "dead-stream");
        assert_eq!(
            broker.get(&keys::owner_key("dead-stream")).await.unwrap().as_deref(),
            Some("w-new")
        );
        assert_eq!(
            broker.get(&keys::owner_key("live-stream")).await.unwrap().as_deref(),
            Some("w-alive")
        );
    }

    #[tokio::test]
    async fn terminal_streams_lose_their_stale_claims() {
        let broker = MemoryBroker::new();
        seed_stream(&broker, "done-stream", "w-dead").await;
        broker
            .hash_set_field(
                &keys::state_key("done-stream"),
                "status",
                StreamStatus::Complete.as_str(),
            )
            .await
            .unwrap();

        let broker_dyn: Arc<dyn Broker> = broker.clone();
        let reclaimed = sweep(&broker_dyn, "w-new").await;

        assert!(reclaimed.is_empty());
        assert_eq!(broker.get(&keys::owner_key("done-stream")).await.unwrap(), None);
    }
}
