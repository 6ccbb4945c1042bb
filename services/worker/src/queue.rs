//! Message queue access and lease management.
//!
//! [`SqsQueue`] is a thin [`MessageQueue`] over the SQS client. The
//! [`LeaseManager`] adds retry around every queue call and hands out a
//! [`MessageLease`] per received message, which the frame loop uses to keep
//! the message invisible while a long video is processed.

use crate::config::{AwsConfig, QueueConfig};
use crate::pipeline::LeaseRenewal;
use crate::retry::{classify_sdk_error, with_retry, RetryPolicy, Retryable};
use async_trait::async_trait;
use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_sqs::Client as SqsClient;
use aws_sdk_ssm::Client as SsmClient;
use aws_types::SdkConfig;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Queue operation errors
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Transient queue failure: {0}")]
    Transient(String),

    #[error("Queue service error: {0}")]
    Service(String),

    #[error("Message {0} carries no receipt handle")]
    MissingReceiptHandle(String),
}

impl QueueError {
    pub(crate) fn from_sdk<E>(err: &SdkError<E, HttpResponse>) -> Self
    where
        E: ProvideErrorMetadata + std::error::Error + 'static,
    {
        match classify_sdk_error(err) {
            (true, message) => QueueError::Transient(message),
            (false, message) => QueueError::Service(message),
        }
    }
}

impl Retryable for QueueError {
    fn is_transient(&self) -> bool {
        matches!(self, QueueError::Transient(_))
    }
}

/// A message held under a visibility lease.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueMessage {
    pub message_id: Option<String>,
    /// Proof of current ownership; required for extend and delete
    pub receipt_handle: String,
    pub body: String,
}

impl QueueMessage {
    pub fn id(&self) -> &str {
        self.message_id.as_deref().unwrap_or("unknown")
    }
}

/// Hosted at-least-once queue.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MessageQueue: Send + Sync {
    /// Long-poll for at most one message, hiding it for `visibility`.
    async fn receive(
        &self,
        wait: Duration,
        visibility: Duration,
    ) -> Result<Option<QueueMessage>, QueueError>;

    /// Reset the message's visibility window to `duration` from now.
    async fn change_visibility(
        &self,
        receipt_handle: &str,
        duration: Duration,
    ) -> Result<(), QueueError>;

    async fn delete(&self, receipt_handle: &str) -> Result<(), QueueError>;

    /// Send `body` to another queue.
    async fn send(&self, queue_url: &str, body: &str) -> Result<(), QueueError>;
}

/// SQS-backed queue bound to a single queue URL.
pub struct SqsQueue {
    client: SqsClient,
    queue_url: String,
}

impl SqsQueue {
    pub fn new(sdk_config: &SdkConfig, aws: &AwsConfig, queue_url: String) -> Self {
        let mut builder = aws_sdk_sqs::config::Builder::from(sdk_config);
        if let Some(ref endpoint_url) = aws.endpoint_url {
            builder = builder.endpoint_url(endpoint_url);
        }

        info!(queue_url = %queue_url, "SQS queue client initialized");

        Self {
            client: SqsClient::from_conf(builder.build()),
            queue_url,
        }
    }
}

#[async_trait]
impl MessageQueue for SqsQueue {
    async fn receive(
        &self,
        wait: Duration,
        visibility: Duration,
    ) -> Result<Option<QueueMessage>, QueueError> {
        let output = self
            .client
            .receive_message()
            .queue_url(&self.queue_url)
            .max_number_of_messages(1)
            .wait_time_seconds(wait.as_secs() as i32)
            .visibility_timeout(visibility.as_secs() as i32)
            .send()
            .await
            .map_err(|e| QueueError::from_sdk(&e))?;

        let Some(message) = output.messages().first() else {
            return Ok(None);
        };

        let message_id = message.message_id().map(String::from);
        let receipt_handle = message.receipt_handle().ok_or_else(|| {
            QueueError::MissingReceiptHandle(message_id.clone().unwrap_or_default())
        })?;

        Ok(Some(QueueMessage {
            receipt_handle: receipt_handle.to_string(),
            body: message.body().unwrap_or_default().to_string(),
            message_id,
        }))
    }

    async fn change_visibility(
        &self,
        receipt_handle: &str,
        duration: Duration,
    ) -> Result<(), QueueError> {
        self.client
            .change_message_visibility()
            .queue_url(&self.queue_url)
            .receipt_handle(receipt_handle)
            .visibility_timeout(duration.as_secs() as i32)
            .send()
            .await
            .map_err(|e| QueueError::from_sdk(&e))?;
        Ok(())
    }

    async fn delete(&self, receipt_handle: &str) -> Result<(), QueueError> {
        self.client
            .delete_message()
            .queue_url(&self.queue_url)
            .receipt_handle(receipt_handle)
            .send()
            .await
            .map_err(|e| QueueError::from_sdk(&e))?;
        Ok(())
    }

    async fn send(&self, queue_url: &str, body: &str) -> Result<(), QueueError> {
        self.client
            .send_message()
            .queue_url(queue_url)
            .message_body(body)
            .send()
            .await
            .map_err(|e| QueueError::from_sdk(&e))?;
        Ok(())
    }
}

/// Resolve the work queue URL, from config or from the parameter store.
pub async fn resolve_queue_url(
    sdk_config: &SdkConfig,
    aws: &AwsConfig,
    config: &QueueConfig,
) -> Result<String, QueueError> {
    if let Some(url) = &config.queue_url {
        return Ok(url.clone());
    }

    let mut builder = aws_sdk_ssm::config::Builder::from(sdk_config);
    if let Some(ref endpoint_url) = aws.endpoint_url {
        builder = builder.endpoint_url(endpoint_url);
    }
    let client = SsmClient::from_conf(builder.build());

    let output = client
        .get_parameter()
        .name(&config.queue_url_parameter)
        .send()
        .await
        .map_err(|e| QueueError::from_sdk(&e))?;

    let url = output
        .parameter()
        .and_then(|p| p.value())
        .ok_or_else(|| {
            QueueError::Service(format!(
                "Parameter {} has no value",
                config.queue_url_parameter
            ))
        })?;

    info!(parameter = %config.queue_url_parameter, "Resolved queue URL from parameter store");
    Ok(url.to_string())
}

/// Timing of receive and lease renewal.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LeaseSettings {
    pub wait_time: Duration,
    /// Visibility granted on receive
    pub visibility_timeout: Duration,
    /// How long a lease may go without renewal
    pub extension_interval: Duration,
    /// Visibility granted on each renewal
    pub extension_duration: Duration,
}

impl From<&QueueConfig> for LeaseSettings {
    fn from(config: &QueueConfig) -> Self {
        Self {
            wait_time: config.wait_time(),
            visibility_timeout: config.visibility_timeout(),
            extension_interval: config.extension_interval(),
            extension_duration: config.extension_duration(),
        }
    }
}

/// Queue operations with retry, plus per-message leases.
pub struct LeaseManager<Q> {
    queue: Q,
    settings: LeaseSettings,
    retry: RetryPolicy,
}

impl<Q: MessageQueue> LeaseManager<Q> {
    pub fn new(queue: Q, settings: LeaseSettings, retry: RetryPolicy) -> Self {
        Self {
            queue,
            settings,
            retry,
        }
    }

    /// Wait up to the configured window for one message.
    pub async fn receive(&self) -> Result<Option<QueueMessage>, QueueError> {
        let LeaseSettings {
            wait_time,
            visibility_timeout,
            ..
        } = self.settings;

        with_retry(&self.retry, "receive_message", || {
            self.queue.receive(wait_time, visibility_timeout)
        })
        .await
    }

    /// Push the message's visibility out by the extension duration.
    ///
    /// Never fails: a lost renewal only risks a redelivery, so failures are
    /// logged and reported as `false`.
    pub async fn extend(&self, message: &QueueMessage) -> bool {
        let duration = self.settings.extension_duration;
        let handle = message.receipt_handle.as_str();

        match with_retry(&self.retry, "change_message_visibility", || {
            self.queue.change_visibility(handle, duration)
        })
        .await
        {
            Ok(()) => {
                info!(
                    message_id = message.id(),
                    visibility_secs = duration.as_secs(),
                    "Extended message visibility"
                );
                true
            }
            Err(e) => {
                warn!(message_id = message.id(), error = %e, "Failed to extend message visibility");
                false
            }
        }
    }

    /// Delete the message. Results already uploaded are not rolled back on failure.
    pub async fn acknowledge(&self, message: &QueueMessage) -> Result<(), QueueError> {
        let handle = message.receipt_handle.as_str();
        with_retry(&self.retry, "delete_message", || self.queue.delete(handle)).await?;
        debug!(message_id = message.id(), "Message deleted from queue");
        Ok(())
    }

    /// Publish `body` on another queue.
    pub async fn notify(&self, queue_url: &str, body: &str) -> Result<(), QueueError> {
        with_retry(&self.retry, "send_message", || self.queue.send(queue_url, body)).await
    }

    /// Start tracking the lease of a freshly received message.
    pub fn lease<'a>(&'a self, message: &'a QueueMessage) -> MessageLease<'a, Q> {
        MessageLease {
            manager: self,
            message,
            last_extended: Instant::now(),
        }
    }
}

/// Renewal state of one in-flight message.
pub struct MessageLease<'a, Q> {
    manager: &'a LeaseManager<Q>,
    message: &'a QueueMessage,
    last_extended: Instant,
}

impl<'a, Q: MessageQueue> MessageLease<'a, Q> {
    /// Whether a renewal is due at `now`.
    pub fn is_due(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_extended) >= self.manager.settings.extension_interval
    }

    pub fn last_extended(&self) -> Instant {
        self.last_extended
    }
}

#[async_trait]
impl<'a, Q: MessageQueue> LeaseRenewal for MessageLease<'a, Q> {
    async fn renew_if_due(&mut self) {
        let now = Instant::now();
        if !self.is_due(now) {
            return;
        }

        // A failed renewal is retried on the next frame.
        if self.manager.extend(self.message).await {
            self.last_extended = now;
        }
    }
}
