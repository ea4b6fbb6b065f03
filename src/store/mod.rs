//! S3-compatible object storage for processed product images.

use crate::config::ObjectStoreConfig;
use crate::error::Result;
use anyhow::Context;
use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use std::collections::HashMap;
use std::time::Duration;

/// Blob storage seam used by the image pipeline and health checks.
///
/// The production implementation is [`S3ObjectStore`]; tests substitute an
/// in-memory double.
#[async_trait::async_trait]
pub trait ObjectStore: Send + Sync {
    /// Write an object with content type, cache headers and provenance
    /// metadata. Keys are namespaced like `products/<uuid>.jpeg`.
    async fn put(
        &self,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
        metadata: &[(&str, &str)],
    ) -> Result<()>;

    /// Cheap liveness probe against the backing bucket.
    async fn health_check(&self) -> Result<()>;

    /// Time-limited signed GET for an object.
    async fn presign_get(&self, key: &str, expires_in: Duration) -> Result<String>;

    /// Public (CDN-facing) URL for a stored key.
    fn public_url(&self, key: &str) -> String;
}

/// Images are immutable once written (random keys), so clients may cache
/// them indefinitely.
const CACHE_CONTROL: &str = "public, max-age=31536000, immutable";

/// `ObjectStore` backed by an S3-compatible service (S3, MinIO, R2).
pub struct S3ObjectStore {
    client: aws_sdk_s3::Client,
    bucket: String,
    public_prefix: String,
}

impl S3ObjectStore {
    /// Build a client for the configured endpoint.
    ///
    /// Path-style addressing is forced so MinIO-style endpoints without
    /// wildcard DNS work out of the box.
    pub async fn from_config(config: &ObjectStoreConfig) -> Result<Self> {
        let credentials = Credentials::new(
            config.object_store_key_id.clone(),
            config.object_store_secret.clone(),
            None,
            None,
            "bindery-config",
        );

        let base = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new("auto"))
            .credentials_provider(credentials)
            .load()
            .await;

        let s3_config = aws_sdk_s3::config::Builder::from(&base)
            .endpoint_url(&config.object_store_endpoint)
            .force_path_style(true)
            .build();

        Ok(Self {
            client: aws_sdk_s3::Client::from_conf(s3_config),
            bucket: config.object_store_bucket.clone(),
            public_prefix: config
                .object_store_public_url
                .trim_end_matches('/')
                .to_string(),
        })
    }
}

#[async_trait::async_trait]
impl ObjectStore for S3ObjectStore {
    async fn put(
        &self,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
        metadata: &[(&str, &str)],
    ) -> Result<()> {
        let user_metadata: HashMap<String, String> = metadata
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(bytes))
            .content_type(content_type)
            .cache_control(CACHE_CONTROL)
            .set_metadata(Some(user_metadata))
            .send()
            .await
            .with_context(|| format!("failed to upload object {key}"))?;

        Ok(())
    }

    async fn health_check(&self) -> Result<()> {
        self.client
            .list_objects_v2()
            .bucket(&self.bucket)
            .max_keys(1)
            .send()
            .await
            .context("object store list failed")?;

        Ok(())
    }

    async fn presign_get(&self, key: &str, expires_in: Duration) -> Result<String> {
        let presigned = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(PresigningConfig::expires_in(expires_in)?)
            .await
            .with_context(|| format!("failed to presign object {key}"))?;

        Ok(presigned.uri().to_string())
    }

    fn public_url(&self, key: &str) -> String {
        format!("{}/{}", self.public_prefix, key)
    }
}
