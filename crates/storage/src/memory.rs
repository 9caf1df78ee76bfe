// SPDX-FileCopyrightText: © 2025 Livereel Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! In-memory object store for tests.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::{ObjectStore, StorageError};

#[derive(Debug, Clone)]
pub struct StoredObject {
    pub data: Bytes,
    pub content_type: String,
    pub cache_control: Option<String>,
}

/// Hermetic [`ObjectStore`] backed by a map. Signed URLs carry a fake scheme
/// so tests can assert on the key without a real signer.
#[derive(Default)]
pub struct MemoryStore {
    objects: Mutex<HashMap<String, StoredObject>>,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, StoredObject>> {
        #[allow(clippy::unwrap_used)] // no panics happen while the lock is held
        self.objects.lock().unwrap()
    }

    /// Number of stored objects whose key starts with `prefix`.
    pub fn count_with_prefix(&self, prefix: &str) -> usize {
        self.lock().keys().filter(|key| key.starts_with(prefix)).count()
    }

    /// Snapshot of a stored object, with metadata.
    pub fn object(&self, key: &str) -> Option<StoredObject> {
        self.lock().get(key).cloned()
    }

    /// All stored keys, sorted.
    pub fn sorted_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.lock().keys().cloned().collect();
        keys.sort_unstable();
        keys
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn put_file(
        &self,
        key: &str,
        path: &Path,
        content_type: &str,
        cache_control: Option<&str>,
    ) -> Result<(), StorageError> {
        let data = tokio::fs::read(path).await?;
        self.lock().insert(
            key.to_string(),
            StoredObject {
                data: Bytes::from(data),
                content_type: content_type.to_string(),
                cache_control: cache_control.map(str::to_string),
            },
        );
        Ok(())
    }

    async fn put_bytes(
        &self,
        key: &str,
        data: Bytes,
        content_type: &str,
    ) -> Result<(), StorageError> {
        self.lock().insert(
            key.to_string(),
            StoredObject { data, content_type: content_type.to_string(), cache_control: None },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Bytes, StorageError> {
        self.lock().get(key).map(|object| object.data.clone()).ok_or_else(|| {
            StorageError::Get {
                key: key.to_string(),
                source: "object not found".into(),
            }
        })
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.lock().remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.lock().contains_key(key))
    }

    async fn signed_get_url(&self, key: &str, _expires: Duration) -> Result<String, StorageError> {
        Ok(format!("memory://get/{key}"))
    }

    async fn signed_put_url(&self, key: &str, _expires: Duration) -> Result<String, StorageError> {
        Ok(format!("memory://put/{key}"))
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[tokio::test]
    async fn put_get_round_trip() {
        let store = MemoryStore::new();
        store
            .put_bytes("recordings/2026/08/01/s1/chunks/chunk_00000000.webm", Bytes::from_static(b"abc"), "video/webm")
            .await
            .unwrap();

        let data = store.get("recordings/2026/08/01/s1/chunks/chunk_00000000.webm").await.unwrap();
        assert_eq!(&data[..], b"abc");
        assert!(store.get("missing").await.is_err());
    }

    #[tokio::test]
    async fn put_is_an_overwrite() {
        let store = MemoryStore::new();
        store.put_bytes("k", Bytes::from_static(b"v1"), "text/plain").await.unwrap();
        store.put_bytes("k", Bytes::from_static(b"v2"), "text/plain").await.unwrap();
        assert_eq!(&store.get("k").await.unwrap()[..], b"v2");
        assert_eq!(store.count_with_prefix("k"), 1);
    }

    #[tokio::test]
    async fn put_file_records_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stream.m3u8");
        tokio::fs::write(&path, "#EXTM3U\n").await.unwrap();

        let store = MemoryStore::new();
        store
            .put_file("s1/hls/stream.m3u8", &path, "application/vnd.apple.mpegurl", Some("no-cache"))
            .await
            .unwrap();

        let object = store.object("s1/hls/stream.m3u8").unwrap();
        assert_eq!(object.content_type, "application/vnd.apple.mpegurl");
        assert_eq!(object.cache_control.as_deref(), Some("no-cache"));
    }
}
