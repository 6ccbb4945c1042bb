//! Per-video frame pipeline.
//!
//! Streams a video frame by frame through the tracker, accumulating one list
//! of [`DetectionRecord`]s and one annotated frame per successful frame. A
//! failing frame ends the loop early; whatever was accumulated is still
//! written out.

use crate::config::PipelineConfig;
use crate::formatter::{format_detections, DetectionRecord};
use crate::tracker::{swap_red_blue, ChannelOrder, TrackParams, Tracker};
use crate::video::{DecodeError, VideoDecoder, VideoEncoder};
use async_trait::async_trait;
use image::RgbImage;
use std::borrow::Cow;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

/// Keeps the in-flight message leased while frames are processed.
#[async_trait]
pub trait LeaseRenewal: Send {
    /// Renew the lease if the renewal interval has elapsed. Never fails.
    async fn renew_if_due(&mut self);
}

/// Errors that abort a whole video
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Cannot read video: {0}")]
    Open(DecodeError),

    #[error("Cannot write annotated video: {0}")]
    Encode(DecodeError),

    #[error("Failed to serialize detections: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Thresholds and output switches for one run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PipelineSettings {
    pub confidence: f32,
    pub iou: f32,
    pub save_video: bool,
}

impl From<&PipelineConfig> for PipelineSettings {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            confidence: config.confidence,
            iou: config.iou,
            save_video: config.save_video,
        }
    }
}

/// Everything produced for one video.
#[derive(Debug, Clone)]
pub struct ResultBundle {
    /// One list per processed frame, possibly empty
    pub records: Vec<Vec<DetectionRecord>>,
    pub json_path: PathBuf,
    /// Absent when annotated output is disabled or no frame was processed
    pub video_path: Option<PathBuf>,
    pub frames_processed: u64,
}

/// JSON and annotated-video file names for a video stem.
pub fn output_file_names(stem: &str) -> (String, String) {
    (
        format!("{}_output.json", stem),
        format!("{}_annotated.mp4", stem),
    )
}

pub struct FramePipeline<D, E> {
    decoder: D,
    encoder: E,
    settings: PipelineSettings,
}

impl<D: VideoDecoder, E: VideoEncoder> FramePipeline<D, E> {
    pub fn new(decoder: D, encoder: E, settings: PipelineSettings) -> Self {
        Self {
            decoder,
            encoder,
            settings,
        }
    }

    /// Run the tracker over every frame of `video_path`, writing results into `output_dir`.
    #[instrument(skip_all, fields(video = %video_path.display()))]
    pub async fn process<T, L>(
        &self,
        video_path: &Path,
        output_dir: &Path,
        tracker: &mut T,
        lease: &mut L,
        filter: Option<&str>,
    ) -> Result<ResultBundle, PipelineError>
    where
        T: Tracker + ?Sized,
        L: LeaseRenewal + ?Sized,
    {
        let stem = video_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "video".to_string());

        tracker.reset();
        let mut source = self.decoder.open(video_path).map_err(PipelineError::Open)?;
        let stream = source.info();

        info!(
            fps = stream.fps,
            width = stream.width,
            height = stream.height,
            "Starting frame loop"
        );

        let params = TrackParams {
            confidence: self.settings.confidence,
            iou: self.settings.iou,
            persist: true,
        };
        let order = tracker.channel_order();

        let mut records: Vec<Vec<DetectionRecord>> = Vec::new();
        let mut annotated: Vec<RgbImage> = Vec::new();

        loop {
            lease.renew_if_due().await;

            let timestamp = records.len() as u64;
            let frame = match source.next() {
                None => break,
                Some(Ok(frame)) => frame,
                Some(Err(e)) => {
                    error!(frame = timestamp, error = %e, "Frame decode failed, keeping partial results");
                    break;
                }
            };

            let input = match order {
                ChannelOrder::Rgb => Cow::Borrowed(&frame.image),
                ChannelOrder::Bgr => Cow::Owned(swap_red_blue(&frame.image)),
            };

            let output = match tracker.track(&input, &params) {
                Ok(output) => output,
                Err(e) => {
                    error!(frame = timestamp, error = %e, "Tracking failed, keeping partial results");
                    break;
                }
            };

            let frame_records = format_detections(&output, timestamp, filter);
            debug!(frame = timestamp, records = frame_records.len(), "Frame processed");
            records.push(frame_records);

            if self.settings.save_video {
                let plotted = tracker.plot(&input, &output);
                annotated.push(match order {
                    ChannelOrder::Rgb => plotted,
                    ChannelOrder::Bgr => swap_red_blue(&plotted),
                });
            }
        }
        drop(source);

        let frames_processed = records.len() as u64;
        let (json_name, video_name) = output_file_names(&stem);

        let json_path = output_dir.join(json_name);
        let document = serde_json::to_vec_pretty(&records)?;
        tokio::fs::write(&json_path, document)
            .await
            .map_err(|source| PipelineError::Io {
                path: json_path.clone(),
                source,
            })?;
        info!(path = %json_path.display(), frames = frames_processed, "Detections written");

        let video_path = if !self.settings.save_video {
            None
        } else if annotated.is_empty() {
            warn!("No frames were processed, skipping annotated video");
            None
        } else {
            let path = output_dir.join(video_name);
            self.encoder
                .encode(&annotated, &stream, &path)
                .map_err(PipelineError::Encode)?;
            info!(path = %path.display(), frames = annotated.len(), "Annotated video written");
            Some(path)
        };

        Ok(ResultBundle {
            records,
            json_path,
            video_path,
            frames_processed,
        })
    }
}
