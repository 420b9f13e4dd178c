//! S3-compatible object storage for the raw zone

use async_trait::async_trait;
use aws_sdk_s3::{
    config::{Credentials, Region},
    error::{DisplayErrorContext, ProvideErrorMetadata, SdkError},
    primitives::ByteStream,
    Client,
};
use permits_common::{checksum, PipelineError, Result};
use tracing::{debug, info, instrument};

use super::{ObjectRef, ObjectStore};
use crate::config::StorageConfig;

const SERVICE: &str = "s3";

/// Map an SDK error onto the pipeline taxonomy. Missing buckets and bad
/// credentials need an operator; everything else is treated as transient.
fn classify<E, R>(bucket: &str, err: SdkError<E, R>) -> PipelineError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
    R: std::fmt::Debug,
{
    if let SdkError::ServiceError(service) = &err {
        match service.err().code() {
            Some("NoSuchBucket") => {
                return PipelineError::config(format!("bucket '{}' does not exist", bucket))
            }
            Some("AccessDenied" | "InvalidAccessKeyId" | "SignatureDoesNotMatch") => {
                return PipelineError::config(format!(
                    "access to bucket '{}' denied: {}",
                    bucket,
                    DisplayErrorContext(&err)
                ))
            }
            _ => {}
        }
    }
    PipelineError::connectivity(SERVICE, DisplayErrorContext(&err))
}

#[derive(Clone)]
pub struct S3ObjectStore {
    client: Client,
    bucket: String,
}

impl S3ObjectStore {
    pub async fn new(config: &StorageConfig) -> Result<Self> {
        debug!(
            endpoint = ?config.endpoint,
            region = %config.region,
            bucket = %config.bucket,
            "Initializing object storage"
        );

        let credentials = Credentials::new(
            &config.access_key,
            &config.secret_key,
            None,
            None,
            "permits-etl",
        );

        let mut s3_config_builder = aws_sdk_s3::Config::builder()
            .credentials_provider(credentials)
            .region(Region::new(config.region.clone()))
            .force_path_style(config.path_style);

        if let Some(endpoint) = &config.endpoint {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint);
        }

        let client = Client::from_conf(s3_config_builder.build());

        info!("Storage client initialized for bucket: {}", config.bucket);

        Ok(Self {
            client,
            bucket: config.bucket.clone(),
        })
    }

    /// Create the bucket if it does not exist yet
    #[instrument(skip(self), fields(bucket = %self.bucket))]
    pub async fn ensure_bucket(&self) -> Result<()> {
        match self.client.head_bucket().bucket(&self.bucket).send().await {
            Ok(_) => return Ok(()),
            Err(err) if err.as_service_error().is_some_and(|e| e.is_not_found()) => {}
            Err(err) => return Err(classify(&self.bucket, err)),
        }

        match self.client.create_bucket().bucket(&self.bucket).send().await {
            Ok(_) => {
                info!("Created bucket {}", self.bucket);
                Ok(())
            }
            Err(err)
                if err.as_service_error().is_some_and(|e| {
                    e.is_bucket_already_owned_by_you() || e.is_bucket_already_exists()
                }) =>
            {
                Ok(())
            }
            Err(err) => Err(classify(&self.bucket, err)),
        }
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    #[instrument(skip(self, bytes), fields(bucket = %self.bucket, size = bytes.len()))]
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<ObjectRef> {
        let checksum = checksum::sha256_hex(&bytes);
        let size = bytes.len() as u64;

        debug!("Uploading {} bytes to s3://{}/{}", size, self.bucket, key);

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type("application/json")
            .metadata("sha256", &checksum)
            .body(ByteStream::from(bytes))
            .send()
            .await
            .map_err(|e| classify(&self.bucket, e))?;

        info!("Uploaded s3://{}/{}", self.bucket, key);

        Ok(ObjectRef {
            bucket: self.bucket.clone(),
            key: key.to_string(),
            checksum,
            size,
        })
    }

    #[instrument(skip(self), fields(bucket = %self.bucket))]
    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let response = match self.client.get_object().bucket(&self.bucket).key(key).send().await {
            Ok(response) => response,
            Err(err) if err.as_service_error().is_some_and(|e| e.is_no_such_key()) => {
                return Err(PipelineError::not_found(format!("s3://{}/{}", self.bucket, key)))
            }
            Err(err) => return Err(classify(&self.bucket, err)),
        };

        let data = response
            .body
            .collect()
            .await
            .map_err(|e| PipelineError::connectivity(SERVICE, e))?
            .into_bytes()
            .to_vec();

        debug!("Downloaded {} bytes from s3://{}/{}", data.len(), self.bucket, key);

        Ok(data)
    }

    #[instrument(skip(self), fields(bucket = %self.bucket))]
    async fn exists(&self, key: &str) -> Result<bool> {
        match self.client.head_object().bucket(&self.bucket).key(key).send().await {
            Ok(_) => Ok(true),
            Err(err) if err.as_service_error().is_some_and(|e| e.is_not_found()) => Ok(false),
            Err(err) => Err(classify(&self.bucket, err)),
        }
    }

    #[instrument(skip(self), fields(bucket = %self.bucket))]
    async fn count(&self, prefix: &str) -> Result<u64> {
        let mut pages = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(prefix)
            .into_paginator()
            .send();

        let mut total = 0u64;
        while let Some(page) = pages.next().await {
            let page = page.map_err(|e| classify(&self.bucket, e))?;
            total += page.contents().len() as u64;
        }

        Ok(total)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_new_uses_configured_bucket() {
        let config = StorageConfig::for_minio("http://localhost:9000", "ottawa-raw");
        let store = S3ObjectStore::new(&config).await.unwrap();
        assert_eq!(store.bucket, "ottawa-raw");
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_connectivity() {
        let config = StorageConfig::for_minio("http://127.0.0.1:1", "ottawa-raw");
        let store = S3ObjectStore::new(&config).await.unwrap();
        let err = store.exists("raw/ottawa-permits.json").await.unwrap_err();
        assert!(err.is_retryable(), "unexpected error: {err}");
    }
}
