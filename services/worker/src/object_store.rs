//! Object store gateway: whole-file download and confirmed upload.

use crate::config::{AwsConfig, StorageConfig};
use crate::retry::{classify_sdk_error, with_retry, RetryPolicy, Retryable};
use async_trait::async_trait;
use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as S3Client;
use aws_types::SdkConfig;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, instrument};

/// Transfer errors
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("Transient storage failure: {0}")]
    Transient(String),

    #[error("Storage service error: {0}")]
    Service(String),

    #[error("Object s3://{bucket}/{key} does not exist")]
    NotFound { bucket: String, key: String },

    #[error("Local file error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Object s3://{bucket}/{key} not visible after {attempts} checks")]
    ConfirmationTimeout {
        bucket: String,
        key: String,
        attempts: u32,
    },
}

impl TransferError {
    fn from_sdk<E>(err: &SdkError<E, HttpResponse>) -> Self
    where
        E: ProvideErrorMetadata + std::error::Error + 'static,
    {
        match classify_sdk_error(err) {
            (true, message) => TransferError::Transient(message),
            (false, message) => TransferError::Service(message),
        }
    }
}

impl Retryable for TransferError {
    fn is_transient(&self) -> bool {
        matches!(self, TransferError::Transient(_))
    }
}

/// Remote content store.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetch `bucket/key` into `local_path`, replacing any existing file.
    async fn download(&self, bucket: &str, key: &str, local_path: &Path)
        -> Result<(), TransferError>;

    /// Store `local_path` at `bucket/key`; returns once the object is visible.
    async fn upload(&self, bucket: &str, key: &str, local_path: &Path) -> Result<(), TransferError>;
}

/// S3 implementation of [`ObjectStore`]
pub struct S3Gateway {
    client: S3Client,
    retry: RetryPolicy,
    poll_interval: Duration,
    max_polls: u32,
}

impl S3Gateway {
    pub fn new(
        sdk_config: &SdkConfig,
        aws: &AwsConfig,
        storage: &StorageConfig,
        retry: RetryPolicy,
    ) -> Self {
        let mut builder = S3ConfigBuilder::from(sdk_config);

        // Custom endpoint for MinIO/LocalStack
        if let Some(ref endpoint_url) = aws.endpoint_url {
            builder = builder.endpoint_url(endpoint_url);
        }
        if aws.force_path_style {
            builder = builder.force_path_style(true);
        }

        info!(region = %aws.region, "S3 gateway initialized");

        Self {
            client: S3Client::from_conf(builder.build()),
            retry,
            poll_interval: storage.confirm_poll_interval(),
            max_polls: storage.confirm_max_attempts,
        }
    }

    async fn fetch(&self, bucket: &str, key: &str, local_path: &Path) -> Result<u64, TransferError> {
        let output = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                if e.as_service_error().map(|e| e.is_no_such_key()).unwrap_or(false) {
                    TransferError::NotFound {
                        bucket: bucket.to_string(),
                        key: key.to_string(),
                    }
                } else {
                    TransferError::from_sdk(&e)
                }
            })?;

        let mut body = output.body;
        let mut file = tokio::fs::File::create(local_path).await?;
        let mut written = 0u64;

        // An interrupted body stream is retried from the start
        while let Some(chunk) = body
            .try_next()
            .await
            .map_err(|e| TransferError::Transient(e.to_string()))?
        {
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;

        Ok(written)
    }

    async fn put(&self, bucket: &str, key: &str, local_path: &Path) -> Result<(), TransferError> {
        let body = ByteStream::from_path(local_path)
            .await
            .map_err(|e| TransferError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?;

        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(body)
            .content_type(content_type(key))
            .send()
            .await
            .map_err(|e| TransferError::from_sdk(&e))?;

        Ok(())
    }

    /// Check if an object exists
    async fn exists(&self, bucket: &str, key: &str) -> Result<bool, TransferError> {
        match self.client.head_object().bucket(bucket).key(key).send().await {
            Ok(_) => Ok(true),
            Err(e) => {
                if e.as_service_error()
                    .map(|e| e.is_not_found())
                    .unwrap_or(false)
                {
                    Ok(false)
                } else {
                    Err(TransferError::from_sdk(&e))
                }
            }
        }
    }

    async fn wait_until_visible(&self, bucket: &str, key: &str) -> Result<(), TransferError> {
        for attempt in 1..=self.max_polls {
            let visible =
                with_retry(&self.retry, "head_object", || self.exists(bucket, key)).await?;
            if visible {
                debug!(bucket, key, attempt, "Upload confirmed");
                return Ok(());
            }
            if attempt < self.max_polls {
                tokio::time::sleep(self.poll_interval).await;
            }
        }

        Err(TransferError::ConfirmationTimeout {
            bucket: bucket.to_string(),
            key: key.to_string(),
            attempts: self.max_polls,
        })
    }
}

#[async_trait]
impl ObjectStore for S3Gateway {
    #[instrument(skip(self, local_path), fields(local = %local_path.display()))]
    async fn download(
        &self,
        bucket: &str,
        key: &str,
        local_path: &Path,
    ) -> Result<(), TransferError> {
        let bytes = with_retry(&self.retry, "get_object", || {
            self.fetch(bucket, key, local_path)
        })
        .await?;

        info!(bucket, key, size_bytes = bytes, "Downloaded object");
        Ok(())
    }

    #[instrument(skip(self, local_path), fields(local = %local_path.display()))]
    async fn upload(&self, bucket: &str, key: &str, local_path: &Path) -> Result<(), TransferError> {
        with_retry(&self.retry, "put_object", || self.put(bucket, key, local_path)).await?;
        self.wait_until_visible(bucket, key).await?;

        info!(bucket, key, "Uploaded object and confirmed visibility");
        Ok(())
    }
}

fn content_type(key: &str) -> &'static str {
    match Path::new(key)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .as_deref()
    {
        Some("json") => "application/json",
        Some("mp4") => "video/mp4",
        _ => "application/octet-stream",
    }
}
