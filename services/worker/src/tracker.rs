//! Boundary of the detection/tracking collaborator.
//!
//! The frame pipeline only sees the [`Tracker`] trait: one decoded frame in,
//! a set of labeled, boxed and optionally tracked objects out, plus a renderer
//! for the annotated frame.

use image::RgbImage;
use std::sync::Arc;
use thiserror::Error;

/// Errors raised by a detection/tracking backend.
#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("Model load failed: {0}")]
    ModelLoad(String),

    #[error("Preprocessing failed: {0}")]
    Preprocessing(String),

    #[error("Inference failed: {0}")]
    Inference(String),

    #[error("Postprocessing failed: {0}")]
    Postprocessing(String),
}

/// Channel order a backend expects its input frames in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelOrder {
    Rgb,
    Bgr,
}

/// Per-call thresholds handed to the backend.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackParams {
    /// Minimum detection confidence
    pub confidence: f32,
    /// Overlap threshold used for suppression
    pub iou: f32,
    /// Carry track identities over from the previous call
    pub persist: bool,
}

/// One object as reported by the backend, before normalization.
///
/// Every field a backend may fail to provide is optional so the formatter can
/// decide what to skip.
#[derive(Debug, Clone, PartialEq)]
pub struct RawDetection {
    /// Normalized center box: x center, y center, width, height
    pub xywhn: Option<[f32; 4]>,
    pub class_id: Option<i64>,
    pub confidence: f32,
    pub track_id: Option<i64>,
}

/// Backend output for a single frame.
#[derive(Debug, Clone, Default)]
pub struct TrackOutput {
    /// Class names indexed by class id
    pub names: Arc<Vec<String>>,
    pub detections: Vec<RawDetection>,
}

/// A frame-level detection and tracking model.
///
/// Implementations keep their own track state between calls when
/// [`TrackParams::persist`] is set; temporal association is entirely theirs.
pub trait Tracker: Send {
    /// Channel order expected by [`Tracker::track`] and produced by [`Tracker::plot`].
    fn channel_order(&self) -> ChannelOrder {
        ChannelOrder::Rgb
    }

    /// Forget every track; called before the first frame of a new video.
    fn reset(&mut self);

    /// Detect and track objects in one frame.
    fn track(&mut self, frame: &RgbImage, params: &TrackParams) -> Result<TrackOutput, TrackerError>;

    /// Return an annotated copy of `frame` showing `output`.
    fn plot(&self, frame: &RgbImage, output: &TrackOutput) -> RgbImage;
}

/// Swap the first and third channel of every pixel (RGB <-> BGR).
pub fn swap_red_blue(frame: &RgbImage) -> RgbImage {
    let mut swapped = frame.clone();
    for pixel in swapped.pixels_mut() {
        pixel.0.swap(0, 2);
    }
    swapped
}
