// SPDX-FileCopyrightText: © 2025 Livereel Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Object storage abstraction for the live streaming pipeline.
//!
//! The pipeline writes three kinds of objects: immutable raw chunks,
//! immutable HLS segments, and the mutable rolling manifest. All of them go
//! through the [`ObjectStore`] trait, so the gateway and the worker are
//! oblivious to the backend. Every operation is idempotent with respect to
//! repeated identical inputs (a PUT is an overwrite).
//!
//! Backends: [`S3Store`](s3::S3Store) (AWS), [`R2Store`](r2::R2Store)
//! (Cloudflare, same wire protocol against the account endpoint), and
//! [`MemoryStore`](memory::MemoryStore) for tests.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod memory;
pub mod r2;
pub mod s3;

pub use memory::MemoryStore;
pub use r2::R2Store;
pub use s3::S3Store;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object put failed for {key}: {source}")]
    Put {
        key: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("object get failed for {key}: {source}")]
    Get {
        key: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("object delete failed for {key}: {source}")]
    Delete {
        key: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("object head failed for {key}: {source}")]
    Head {
        key: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("signing failed for {key}: {detail}")]
    Sign { key: String, detail: String },

    #[error("storage configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Uniform object operations over a pluggable backend.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Uploads a local file. `cache_control` is set verbatim when given
    /// (the manifest is uploaded with `no-cache`).
    async fn put_file(
        &self,
        key: &str,
        path: &Path,
        content_type: &str,
        cache_control: Option<&str>,
    ) -> Result<(), StorageError>;

    /// Uploads an in-memory buffer.
    async fn put_bytes(&self, key: &str, data: Bytes, content_type: &str)
        -> Result<(), StorageError>;

    /// Fetches a whole object.
    async fn get(&self, key: &str) -> Result<Bytes, StorageError>;

    async fn delete(&self, key: &str) -> Result<(), StorageError>;

    /// Existence check via HEAD.
    async fn exists(&self, key: &str) -> Result<bool, StorageError>;

    /// Pre-signed read URL, issued for downstream playback clients. The
    /// pipeline itself never dereferences these.
    async fn signed_get_url(&self, key: &str, expires: Duration) -> Result<String, StorageError>;

    /// Pre-signed write URL, issued for external uploaders.
    async fn signed_put_url(&self, key: &str, expires: Duration) -> Result<String, StorageError>;
}

/// Credentials and addressing for the bucket-based backends.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub bucket: String,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub access_key_id: String,
    #[serde(default)]
    pub secret_access_key: String,
    /// R2 account id, or a custom endpoint for S3-compatible services.
    #[serde(default)]
    pub account_id: Option<String>,
    #[serde(default)]
    pub endpoint_url: Option<String>,
}

impl StoreConfig {
    /// # Errors
    ///
    /// Returns an error when a required field is blank.
    pub fn validate(&self) -> Result<(), StorageError> {
        if self.bucket.trim().is_empty() {
            return Err(StorageError::Config("bucket cannot be empty".to_string()));
        }
        if self.access_key_id.trim().is_empty() {
            return Err(StorageError::Config("access key id cannot be empty".to_string()));
        }
        if self.secret_access_key.trim().is_empty() {
            return Err(StorageError::Config("secret access key cannot be empty".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> StoreConfig {
        StoreConfig {
            bucket: "media".to_string(),
            region: "us-east-1".to_string(),
            access_key_id: "ak".to_string(),
            secret_access_key: "sk".to_string(),
            account_id: None,
            endpoint_url: None,
        }
    }

    #[test]
    fn validate_rejects_blank_fields() {
        assert!(base_config().validate().is_ok());

        let mut config = base_config();
        config.bucket = "  ".to_string();
        assert!(config.validate().is_err());

        let mut config = base_config();
        config.secret_access_key = String::new();
        assert!(config.validate().is_err());
    }
}
