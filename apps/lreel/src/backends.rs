// SPDX-FileCopyrightText: © 2025 Livereel Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Composition of the process-wide backend handles.
//!
//! The broker, object store, and recording store are constructed once in
//! `main` (or by a test harness) and passed around as owned `Arc` handles;
//! nothing downstream knows which backend it is talking to.

use std::sync::Arc;

use anyhow::Context;

use livereel_broker::{Broker, RedisBroker};
use livereel_records::{RecordingStore, SqlRecordStore};
use livereel_storage::{MemoryStore, ObjectStore, R2Store, S3Store, StoreConfig};

use crate::config::{Config, StorageBackend};

pub async fn build_broker(config: &Config) -> anyhow::Result<Arc<dyn Broker>> {
    let broker = RedisBroker::connect(&config.broker.url)
        .await
        .with_context(|| format!("connecting to broker at {}", config.broker.url))?;
    Ok(Arc::new(broker))
}

pub async fn build_store(config: &Config) -> anyhow::Result<Arc<dyn ObjectStore>> {
    let store_config = StoreConfig {
        bucket: config.storage.bucket.clone(),
        region: config.storage.region.clone(),
        access_key_id: config.storage.access_key_id.clone(),
        secret_access_key: config.storage.secret_access_key.clone(),
        account_id: config.storage.account_id.clone(),
        endpoint_url: config.storage.endpoint_url.clone(),
    };

    Ok(match config.storage.backend {
        StorageBackend::S3 => {
            Arc::new(S3Store::new(&store_config).await.context("building S3 store")?)
        }
        StorageBackend::R2 => {
            Arc::new(R2Store::new(&store_config).await.context("building R2 store")?)
        }
        StorageBackend::Memory => {
            tracing::warn!("Using in-memory object store; objects will not survive restarts");
            MemoryStore::new()
        }
    })
}

pub async fn build_records(config: &Config) -> anyhow::Result<Arc<dyn RecordingStore>> {
    let store = SqlRecordStore::connect(&config.records.database_url)
        .await
        .with_context(|| format!("connecting to records db at {}", config.records.database_url))?;
    store.ensure_schema().await.context("ensuring recordings schema")?;
    Ok(Arc::new(store))
}
