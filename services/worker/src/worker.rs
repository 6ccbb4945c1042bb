//! Top-level worker loop.
//!
//! Each received message moves through
//! `Received -> Downloading -> Processing -> Uploading -> CleaningUp -> Acknowledging
//! -> Acknowledged`.
//! Any unrecovered error abandons the message at its current stage: nothing
//! is acknowledged and the queue redelivers it once the lease lapses. The
//! message's scratch directory is removed on every path.

use crate::config::Config;
use crate::object_store::{ObjectStore, TransferError};
use crate::pipeline::{FramePipeline, LeaseRenewal, PipelineError};
use crate::queue::{LeaseManager, MessageQueue, QueueError, QueueMessage};
use crate::tracker::Tracker;
use crate::video::{VideoDecoder, VideoEncoder};
use percent_encoding::percent_decode_str;
use serde_json::Value;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

/// Where in the per-message state machine a message currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Polling,
    Received,
    Downloading,
    Processing,
    Uploading,
    Notifying,
    CleaningUp,
    Acknowledging,
    Acknowledged,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Polling => "polling",
            Stage::Received => "received",
            Stage::Downloading => "downloading",
            Stage::Processing => "processing",
            Stage::Uploading => "uploading",
            Stage::Notifying => "notifying",
            Stage::CleaningUp => "cleaning_up",
            Stage::Acknowledging => "acknowledging",
            Stage::Acknowledged => "acknowledged",
        };
        f.write_str(name)
    }
}

/// Errors that abandon a message
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Failed to receive message: {0}")]
    Receive(QueueError),

    #[error("Message body is not valid JSON: {0}")]
    BadBody(#[from] serde_json::Error),

    #[error("Download of s3://{bucket}/{key} failed: {source}")]
    Download {
        bucket: String,
        key: String,
        #[source]
        source: TransferError,
    },

    #[error("Video processing failed: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("Upload of s3://{bucket}/{key} failed: {source}")]
    Upload {
        bucket: String,
        key: String,
        #[source]
        source: TransferError,
    },

    #[error("Completion notice failed: {0}")]
    Notify(QueueError),

    #[error("Failed to delete message: {0}")]
    Acknowledge(QueueError),

    #[error("Scratch directory error while {stage}: {source}")]
    Io {
        stage: Stage,
        #[source]
        source: std::io::Error,
    },
}

impl WorkerError {
    /// Stage at which the message was abandoned.
    pub fn stage(&self) -> Stage {
        match self {
            WorkerError::Receive(_) => Stage::Polling,
            WorkerError::BadBody(_) => Stage::Received,
            WorkerError::Download { .. } => Stage::Downloading,
            WorkerError::Pipeline(_) => Stage::Processing,
            WorkerError::Upload { .. } => Stage::Uploading,
            WorkerError::Notify(_) => Stage::Notifying,
            WorkerError::Acknowledge(_) => Stage::Acknowledging,
            WorkerError::Io { stage, .. } => *stage,
        }
    }
}

/// One object referenced by a storage event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageEventRecord {
    pub bucket: String,
    /// Decoded object key
    pub key: String,
}

impl StorageEventRecord {
    /// Last path segment of the key.
    pub fn file_name(&self) -> &str {
        self.key.rsplit('/').next().unwrap_or(&self.key)
    }

    /// Whether the key ends in one of `extensions` (case-insensitive, leading dot optional).
    pub fn is_video(&self, extensions: &[String]) -> bool {
        let Some(extension) = Path::new(self.file_name())
            .extension()
            .and_then(|e| e.to_str())
        else {
            return false;
        };

        extensions
            .iter()
            .any(|wanted| wanted.trim_start_matches('.').eq_ignore_ascii_case(extension))
    }
}

/// Object keys in storage events are form-encoded.
fn decode_key(raw: &str) -> String {
    percent_decode_str(&raw.replace('+', " "))
        .decode_utf8_lossy()
        .into_owned()
}

/// Extract bucket/key pairs from a queue message body.
///
/// The body is either an event with a `Records` array or a single record.
/// Records without a bucket name and object key are skipped with a warning.
pub fn parse_event_records(body: &str) -> Result<Vec<StorageEventRecord>, serde_json::Error> {
    let document: Value = serde_json::from_str(body)?;

    let records = match document.get("Records") {
        Some(Value::Array(records)) => records.clone(),
        Some(other) => {
            warn!(records = %other, "Records is not an array, ignoring message content");
            Vec::new()
        }
        None => {
            debug!("Message has no Records key, treating it as a single record");
            vec![document]
        }
    };

    Ok(records
        .iter()
        .filter_map(|record| {
            let s3 = record.get("s3");
            let bucket = s3
                .and_then(|s| s.pointer("/bucket/name"))
                .and_then(Value::as_str);
            let key = s3
                .and_then(|s| s.pointer("/object/key"))
                .and_then(Value::as_str);

            match (bucket, key) {
                (Some(bucket), Some(key)) => Some(StorageEventRecord {
                    bucket: bucket.to_string(),
                    key: decode_key(key),
                }),
                _ => {
                    warn!(record = %record, "Record carries no storage bucket and key, skipping");
                    None
                }
            }
        })
        .collect())
}

/// Loop-level settings.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub scratch_dir: PathBuf,
    pub output_prefix: String,
    pub label_filter: Option<String>,
    pub video_extensions: Vec<String>,
    pub completion_queue_url: Option<String>,
    /// Pause after an empty poll
    pub idle_sleep: Duration,
    /// Pause after a failed poll
    pub error_sleep: Duration,
}

impl From<&Config> for WorkerSettings {
    fn from(config: &Config) -> Self {
        Self {
            scratch_dir: config.pipeline.scratch_dir.clone(),
            output_prefix: config.storage.output_prefix.clone(),
            // An empty filter keeps every label
            label_filter: config
                .pipeline
                .label_filter
                .clone()
                .filter(|label| !label.is_empty()),
            video_extensions: config.pipeline.video_extensions.clone(),
            completion_queue_url: config.queue.completion_queue_url.clone(),
            idle_sleep: config.queue.idle_sleep(),
            error_sleep: config.queue.error_sleep(),
        }
    }
}

/// Keys under which one video's results were stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedResult {
    pub json_key: String,
    pub video_key: Option<String>,
}

pub struct Worker<Q, S, T, D, E> {
    leases: LeaseManager<Q>,
    store: S,
    tracker: T,
    pipeline: FramePipeline<D, E>,
    settings: WorkerSettings,
}

impl<Q, S, T, D, E> Worker<Q, S, T, D, E>
where
    Q: MessageQueue,
    S: ObjectStore,
    T: Tracker,
    D: VideoDecoder,
    E: VideoEncoder,
{
    pub fn new(
        leases: LeaseManager<Q>,
        store: S,
        tracker: T,
        pipeline: FramePipeline<D, E>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            leases,
            store,
            tracker,
            pipeline,
            settings,
        }
    }

    /// Poll and process messages until the task is dropped.
    pub async fn run(&mut self) {
        info!(scratch_dir = %self.settings.scratch_dir.display(), "Starting worker loop");

        loop {
            match self.poll_once().await {
                Ok(true) => {}
                Ok(false) => {
                    debug!("No messages found, continuing to poll");
                    tokio::time::sleep(self.settings.idle_sleep).await;
                }
                Err(e) => {
                    error!(error = %e, "Error in message polling loop");
                    metrics::counter!("worker.queue.errors").increment(1);
                    tokio::time::sleep(self.settings.error_sleep).await;
                }
            }
        }
    }

    /// Receive and handle at most one message.
    ///
    /// Returns `Ok(false)` when the queue was empty. A failing message is
    /// logged and left for redelivery; only queue polling errors are returned.
    pub async fn poll_once(&mut self) -> Result<bool, WorkerError> {
        let Some(message) = self.leases.receive().await.map_err(WorkerError::Receive)? else {
            return Ok(false);
        };

        metrics::counter!("worker.messages.received").increment(1);

        match self.handle_message(&message).await {
            Ok(published) => {
                metrics::counter!("worker.messages.processed").increment(1);
                info!(
                    message_id = message.id(),
                    videos = published.len(),
                    "Message processed and deleted from queue"
                );
            }
            Err(e) => {
                metrics::counter!("worker.messages.failed", "stage" => e.stage().to_string())
                    .increment(1);
                error!(
                    message_id = message.id(),
                    stage = %e.stage(),
                    error = %e,
                    "Message abandoned, leaving it for redelivery"
                );
            }
        }

        Ok(true)
    }

    /// Run the full pipeline for every video in `message`, then delete it.
    #[instrument(skip(self, message), fields(message_id = message.id()))]
    pub async fn handle_message(
        &mut self,
        message: &QueueMessage,
    ) -> Result<Vec<PublishedResult>, WorkerError> {
        let records = parse_event_records(&message.body)?;
        debug!(records = records.len(), "Parsed storage event");

        let Self {
            leases,
            store,
            tracker,
            pipeline,
            settings,
        } = self;

        let scratch_error = |source| WorkerError::Io {
            stage: Stage::Received,
            source,
        };
        tokio::fs::create_dir_all(&settings.scratch_dir)
            .await
            .map_err(scratch_error)?;
        let scratch = tempfile::Builder::new()
            .prefix("msg-")
            .tempdir_in(&settings.scratch_dir)
            .map_err(scratch_error)?;

        let stages = RecordStages {
            store: &*store,
            pipeline: &*pipeline,
            settings: &*settings,
            leases: &*leases,
        };
        let mut lease = leases.lease(message);
        let mut published = Vec::new();

        for (position, record) in records.iter().enumerate() {
            if !record.is_video(&settings.video_extensions) {
                info!(bucket = %record.bucket, key = %record.key, "Skipping non-video file");
                continue;
            }

            let work_dir = scratch.path().join(format!("record-{}", position));
            tokio::fs::create_dir(&work_dir)
                .await
                .map_err(|source| WorkerError::Io {
                    stage: Stage::Downloading,
                    source,
                })?;

            published.push(
                stages
                    .process_record(record, &work_dir, &mut *tracker, &mut lease)
                    .await?,
            );
        }

        info!(stage = %Stage::CleaningUp, "Removing scratch directory");
        scratch.close().map_err(|source| WorkerError::Io {
            stage: Stage::CleaningUp,
            source,
        })?;

        info!(stage = %Stage::Acknowledging, "Deleting message");
        leases
            .acknowledge(message)
            .await
            .map_err(WorkerError::Acknowledge)?;
        info!(stage = %Stage::Acknowledged, "Message acknowledged");

        Ok(published)
    }
}

/// Borrowed view of the worker used while one message holds its lease.
struct RecordStages<'a, Q, S, D, E> {
    store: &'a S,
    pipeline: &'a FramePipeline<D, E>,
    settings: &'a WorkerSettings,
    leases: &'a LeaseManager<Q>,
}

impl<'a, Q, S, D, E> RecordStages<'a, Q, S, D, E>
where
    Q: MessageQueue,
    S: ObjectStore,
    D: VideoDecoder,
    E: VideoEncoder,
{
    #[instrument(skip_all, fields(bucket = %record.bucket, key = %record.key))]
    async fn process_record<T, L>(
        &self,
        record: &StorageEventRecord,
        work_dir: &Path,
        tracker: &mut T,
        lease: &mut L,
    ) -> Result<PublishedResult, WorkerError>
    where
        T: Tracker + ?Sized,
        L: LeaseRenewal + ?Sized,
    {
        let local_input = work_dir.join(record.file_name());

        info!(stage = %Stage::Downloading, "Downloading video");
        self.store
            .download(&record.bucket, &record.key, &local_input)
            .await
            .map_err(|source| WorkerError::Download {
                bucket: record.bucket.clone(),
                key: record.key.clone(),
                source,
            })?;

        info!(stage = %Stage::Processing, "Processing video");
        let bundle = self
            .pipeline
            .process(
                &local_input,
                work_dir,
                tracker,
                lease,
                self.settings.label_filter.as_deref(),
            )
            .await?;
        metrics::counter!("worker.frames.processed").increment(bundle.frames_processed);

        // Processing can outlast a renewal interval on its own
        lease.renew_if_due().await;

        info!(stage = %Stage::Uploading, frames = bundle.frames_processed, "Uploading results");
        let json_key = self.upload(&record.bucket, &bundle.json_path).await?;
        let video_key = match &bundle.video_path {
            Some(path) => Some(self.upload(&record.bucket, path).await?),
            None => None,
        };

        let published = PublishedResult {
            json_key,
            video_key,
        };

        if let Some(queue_url) = &self.settings.completion_queue_url {
            info!(stage = %Stage::Notifying, "Sending completion notice");
            let body = serde_json::json!({
                "video": published.video_key,
                "json": published.json_key,
            })
            .to_string();
            self.leases
                .notify(queue_url, &body)
                .await
                .map_err(WorkerError::Notify)?;
        }

        tokio::fs::remove_dir_all(work_dir)
            .await
            .map_err(|source| WorkerError::Io {
                stage: Stage::CleaningUp,
                source,
            })?;

        info!(json_key = %published.json_key, "Processing complete");
        Ok(published)
    }

    async fn upload(&self, bucket: &str, local_path: &Path) -> Result<String, WorkerError> {
        let file_name = local_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let key = format!("{}{}", self.settings.output_prefix, file_name);

        self.store
            .upload(bucket, &key, local_path)
            .await
            .map_err(|source| WorkerError::Upload {
                bucket: bucket.to_string(),
                key: key.clone(),
                source,
            })?;

        Ok(key)
    }
}
