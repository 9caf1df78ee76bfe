// SPDX-FileCopyrightText: © 2025 Livereel Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Cloudflare R2 backend.
//!
//! R2 speaks the S3 wire protocol against a per-account endpoint, so this
//! backend delegates to the same SDK plumbing as [`S3Store`] with the
//! endpoint derived from the account id.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::s3::{build_client, S3Store};
use crate::{ObjectStore, StorageError, StoreConfig};

/// [`ObjectStore`] backed by a Cloudflare R2 bucket.
pub struct R2Store {
    inner: S3Store,
}

impl R2Store {
    /// # Errors
    ///
    /// Returns an error if the configuration is incomplete or names neither
    /// an account id nor an explicit endpoint.
    pub async fn new(config: &StoreConfig) -> Result<Self, StorageError> {
        config.validate()?;

        let endpoint = match (&config.endpoint_url, &config.account_id) {
            (Some(endpoint), _) => endpoint.clone(),
            (None, Some(account_id)) => {
                format!("https://{account_id}.r2.cloudflarestorage.com")
            }
            (None, None) => {
                return Err(StorageError::Config(
                    "R2 backend needs account_id or endpoint_url".to_string(),
                ));
            }
        };

        // R2 ignores the region but the SDK requires one.
        let client = build_client(config, "auto".to_string(), Some(endpoint)).await;
        Ok(Self { inner: S3Store::from_parts(client, config.bucket.clone()) })
    }
}

#[async_trait]
impl ObjectStore for R2Store {
    async fn put_file(
        &self,
        key: &str,
        path: &Path,
        content_type: &str,
        cache_control: Option<&str>,
    ) -> Result<(), StorageError> {
        self.inner.put_file(key, path, content_type, cache_control).await
    }

    async fn put_bytes(
        &self,
        key: &str,
        data: Bytes,
        content_type: &str,
    ) -> Result<(), StorageError> {
        self.inner.put_bytes(key, data, content_type).await
    }

    async fn get(&self, key: &str) -> Result<Bytes, StorageError> {
        self.inner.get(key).await
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.inner.delete(key).await
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        self.inner.exists(key).await
    }

    async fn signed_get_url(&self, key: &str, expires: Duration) -> Result<String, StorageError> {
        self.inner.signed_get_url(key, expires).await
    }

    async fn signed_put_url(&self, key: &str, expires: Duration) -> Result<String, StorageError> {
        self.inner.signed_put_url(key, expires).await
    }
}
