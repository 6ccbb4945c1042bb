//! Vidtrack Worker
//!
//! Long-running video tracking worker. It consumes storage-upload
//! notifications from a queue, downloads each referenced video, runs a
//! per-frame detection and tracking pass over it, and publishes a detection
//! document plus an annotated video back to the source bucket.
//!
//! ## Features
//!
//! - **Lease Management**: Visibility extension while a video is processed,
//!   so minute-long jobs keep their message
//! - **Best-Effort Partial Output**: A failing frame ends the video early
//!   but everything before it is still published
//! - **Confirmed Uploads**: An upload only counts once the object is visible
//! - **At-Least-Once Semantics**: A message is deleted only after every
//!   artifact is stored and local files are gone
//!
//! ## Architecture
//!
//! ```text
//!  SQS Queue                  Worker                        S3 Bucket
//! ┌──────────────┐     ┌──────────────────┐           ┌──────────────┐
//! │ Storage      │────▶│ Lease Manager    │           │ uploads/     │
//! │ Events       │◀────│ (extend/delete)  │           │   *.mp4      │
//! └──────────────┘     └──────────────────┘           └──────────────┘
//!                               │                            │
//!                               ▼                            │
//!                      ┌──────────────────┐   download       │
//!                      │ Object Store     │◀─────────────────┘
//!                      │ Gateway          │──────────────────┐
//!                      └──────────────────┘   upload         │
//!                               │                            ▼
//!                               ▼                     ┌──────────────┐
//!                      ┌──────────────────┐           │ output/      │
//!                      │ Frame Pipeline   │           │   *.json     │
//!                      │  ├─ Tracker      │           │   *.mp4      │
//!                      │  └─ Formatter    │           └──────────────┘
//!                      └──────────────────┘
//! ```

pub mod config;
pub mod detector;
pub mod formatter;
pub mod object_store;
pub mod pipeline;
pub mod queue;
pub mod retry;
pub mod tracker;
pub mod video;
pub mod worker;

pub use config::{Config, ConfigValidationError};
pub use detector::OnnxTracker;
pub use formatter::{format_detections, BoundingBox, DetectionRecord, FormatError};
pub use object_store::{ObjectStore, S3Gateway, TransferError};
pub use pipeline::{FramePipeline, LeaseRenewal, PipelineError, PipelineSettings, ResultBundle};
pub use queue::{
    resolve_queue_url, LeaseManager, LeaseSettings, MessageLease, MessageQueue, QueueError,
    QueueMessage, SqsQueue,
};
pub use retry::{with_retry, RetryPolicy, Retryable};
pub use tracker::{ChannelOrder, RawDetection, TrackOutput, TrackParams, Tracker, TrackerError};
pub use video::{DecodeError, Frame, FrameSource, GstDecoder, GstEncoder, StreamInfo, VideoDecoder, VideoEncoder};
pub use worker::{
    parse_event_records, PublishedResult, Stage, StorageEventRecord, Worker, WorkerError,
    WorkerSettings,
};
