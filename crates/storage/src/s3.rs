// SPDX-FileCopyrightText: © 2025 Livereel Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! AWS S3 backend.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_credential_types::Credentials;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use bytes::Bytes;
use tracing::debug;

use crate::{ObjectStore, StorageError, StoreConfig};

/// Builds the SDK client shared by the S3 and R2 backends.
pub(crate) async fn build_client(
    config: &StoreConfig,
    region: String,
    endpoint: Option<String>,
) -> Client {
    let credentials = Credentials::new(
        config.access_key_id.clone(),
        config.secret_access_key.clone(),
        None,
        None,
        "livereel-storage",
    );

    let mut builder = aws_config::defaults(BehaviorVersion::latest())
        .region(Region::new(region))
        .credentials_provider(credentials);

    if let Some(endpoint) = endpoint {
        builder = builder.endpoint_url(endpoint);
    }

    let sdk_config = builder.load().await;
    Client::new(&sdk_config)
}

/// [`ObjectStore`] backed by an AWS S3 bucket.
pub struct S3Store {
    client: Client,
    bucket: String,
}

impl S3Store {
    /// # Errors
    ///
    /// Returns an error if the configuration is incomplete.
    pub async fn new(config: &StoreConfig) -> Result<Self, StorageError> {
        config.validate()?;
        let region = if config.region.trim().is_empty() {
            "us-east-1".to_string()
        } else {
            config.region.clone()
        };
        let client = build_client(config, region, config.endpoint_url.clone()).await;
        Ok(Self { client, bucket: config.bucket.clone() })
    }

    pub(crate) fn from_parts(client: Client, bucket: String) -> Self {
        Self { client, bucket }
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn put_file(
        &self,
        key: &str,
        path: &Path,
        content_type: &str,
        cache_control: Option<&str>,
    ) -> Result<(), StorageError> {
        let body = ByteStream::from_path(path).await.map_err(|e| StorageError::Put {
            key: key.to_string(),
            source: Box::new(e),
        })?;

        let mut request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(body)
            .content_type(content_type);
        if let Some(cache_control) = cache_control {
            request = request.cache_control(cache_control);
        }

        request.send().await.map_err(|e| StorageError::Put {
            key: key.to_string(),
            source: Box::new(e),
        })?;

        debug!(key = %key, path = %path.display(), "Uploaded file object");
        Ok(())
    }

    async fn put_bytes(
        &self,
        key: &str,
        data: Bytes,
        content_type: &str,
    ) -> Result<(), StorageError> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(data))
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| StorageError::Put { key: key.to_string(), source: Box::new(e) })?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Bytes, StorageError> {
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| StorageError::Get { key: key.to_string(), source: Box::new(e) })?;

        let data = output
            .body
            .collect()
            .await
            .map_err(|e| StorageError::Get { key: key.to_string(), source: Box::new(e) })?;
        Ok(data.into_bytes())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| StorageError::Delete { key: key.to_string(), source: Box::new(e) })?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        match self.client.head_object().bucket(&self.bucket).key(key).send().await {
            Ok(_) => Ok(true),
            Err(err) => {
                let not_found = err
                    .as_service_error()
                    .is_some_and(aws_sdk_s3::operation::head_object::HeadObjectError::is_not_found);
                if not_found {
                    Ok(false)
                } else {
                    Err(StorageError::Head { key: key.to_string(), source: Box::new(err) })
                }
            }
        }
    }

    async fn signed_get_url(&self, key: &str, expires: Duration) -> Result<String, StorageError> {
        let config = PresigningConfig::expires_in(expires)
            .map_err(|e| StorageError::Sign { key: key.to_string(), detail: e.to_string() })?;
        let request = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(config)
            .await
            .map_err(|e| StorageError::Sign { key: key.to_string(), detail: e.to_string() })?;
        Ok(request.uri().to_string())
    }

    async fn signed_put_url(&self, key: &str, expires: Duration) -> Result<String, StorageError> {
        let config = PresigningConfig::expires_in(expires)
            .map_err(|e| StorageError::Sign { key: key.to_string(), detail: e.to_string() })?;
        let request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(config)
            .await
            .map_err(|e| StorageError::Sign { key: key.to_string(), detail: e.to_string() })?;
        Ok(request.uri().to_string())
    }
}
