//! YOLOv8-style ONNX detector with greedy IoU track association.
//!
//! This is the default [`Tracker`] backend. The model output is expected in
//! the usual `[1, 4 + classes, boxes]` layout with center boxes in input
//! pixels.

use crate::config::ModelConfig;
use crate::tracker::{RawDetection, TrackOutput, TrackParams, Tracker, TrackerError};
use image::imageops::FilterType;
use image::{Rgb, RgbImage};
use imageproc::drawing::draw_hollow_rect_mut;
use imageproc::rect::Rect;
use ndarray::{Array, ArrayViewD};
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::TensorRef;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// COCO class names used when no label file is configured.
pub const COCO_LABELS: [&str; 80] = [
    "person", "bicycle", "car", "motorcycle", "airplane", "bus", "train", "truck", "boat",
    "traffic light", "fire hydrant", "stop sign", "parking meter", "bench", "bird", "cat", "dog",
    "horse", "sheep", "cow", "elephant", "bear", "zebra", "giraffe", "backpack", "umbrella",
    "handbag", "tie", "suitcase", "frisbee", "skis", "snowboard", "sports ball", "kite",
    "baseball bat", "baseball glove", "skateboard", "surfboard", "tennis racket", "bottle",
    "wine glass", "cup", "fork", "knife", "spoon", "bowl", "banana", "apple", "sandwich",
    "orange", "broccoli", "carrot", "hot dog", "pizza", "donut", "cake", "chair", "couch",
    "potted plant", "bed", "dining table", "toilet", "tv", "laptop", "mouse", "remote",
    "keyboard", "cell phone", "microwave", "oven", "toaster", "sink", "refrigerator", "book",
    "clock", "vase", "scissors", "teddy bear", "hair drier", "toothbrush",
];

const TRACK_PALETTE: [[u8; 3]; 10] = [
    [255, 64, 64],
    [64, 255, 64],
    [64, 64, 255],
    [255, 255, 64],
    [255, 64, 255],
    [64, 255, 255],
    [255, 128, 0],
    [128, 0, 255],
    [255, 128, 192],
    [128, 255, 128],
];

/// Minimum overlap for a detection to continue an existing track.
const TRACK_MATCH_IOU: f32 = 0.3;

/// Frames a track may go unmatched before it is dropped.
const TRACK_MAX_AGE: u32 = 30;

/// Candidate box in normalized center form.
#[derive(Debug, Clone, PartialEq)]
struct Candidate {
    xywhn: [f32; 4],
    class_id: usize,
    confidence: f32,
}

fn corners(xywhn: &[f32; 4]) -> [f32; 4] {
    let [x, y, w, h] = *xywhn;
    [x - w / 2.0, y - h / 2.0, x + w / 2.0, y + h / 2.0]
}

/// Intersection over union of two center boxes.
fn iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
    let [ax1, ay1, ax2, ay2] = corners(a);
    let [bx1, by1, bx2, by2] = corners(b);

    let inter_w = (ax2.min(bx2) - ax1.max(bx1)).max(0.0);
    let inter_h = (ay2.min(by2) - ay1.max(by1)).max(0.0);
    let intersection = inter_w * inter_h;
    let union = a[2] * a[3] + b[2] * b[3] - intersection;

    if union <= 0.0 {
        0.0
    } else {
        intersection / union
    }
}

/// Class-wise non-maximum suppression, highest confidence first.
fn non_max_suppression(mut candidates: Vec<Candidate>, threshold: f32) -> Vec<Candidate> {
    candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut keep: Vec<Candidate> = Vec::new();
    for candidate in candidates {
        let suppressed = keep.iter().any(|kept| {
            kept.class_id == candidate.class_id && iou(&kept.xywhn, &candidate.xywhn) >= threshold
        });
        if !suppressed {
            keep.push(candidate);
        }
    }
    keep
}

#[derive(Debug, Clone)]
struct Track {
    id: i64,
    class_id: usize,
    xywhn: [f32; 4],
    missed: u32,
}

/// Greedy IoU association of detections to live tracks.
#[derive(Debug, Default)]
struct IouTracker {
    tracks: Vec<Track>,
    next_id: i64,
}

impl IouTracker {
    fn reset(&mut self) {
        self.tracks.clear();
        self.next_id = 0;
    }

    /// Assign a track id to every candidate, in the candidates' order.
    fn update(&mut self, candidates: &[Candidate]) -> Vec<i64> {
        let mut matched = vec![false; self.tracks.len()];
        let mut ids = Vec::with_capacity(candidates.len());

        for candidate in candidates {
            let best = self
                .tracks
                .iter()
                .enumerate()
                .filter(|(i, track)| !matched[*i] && track.class_id == candidate.class_id)
                .map(|(i, track)| (i, iou(&track.xywhn, &candidate.xywhn)))
                .filter(|(_, overlap)| *overlap >= TRACK_MATCH_IOU)
                .max_by(|a, b| a.1.total_cmp(&b.1));

            let id = match best {
                Some((i, _)) => {
                    matched[i] = true;
                    let track = &mut self.tracks[i];
                    track.xywhn = candidate.xywhn;
                    track.missed = 0;
                    track.id
                }
                None => {
                    self.next_id += 1;
                    self.tracks.push(Track {
                        id: self.next_id,
                        class_id: candidate.class_id,
                        xywhn: candidate.xywhn,
                        missed: 0,
                    });
                    matched.push(true);
                    self.next_id
                }
            };
            ids.push(id);
        }

        for (track, was_matched) in self.tracks.iter_mut().zip(&matched) {
            if !was_matched {
                track.missed += 1;
            }
        }
        self.tracks.retain(|track| track.missed <= TRACK_MAX_AGE);

        ids
    }
}

/// ONNX Runtime detector with built-in track association.
pub struct OnnxTracker {
    session: Session,
    names: Arc<Vec<String>>,
    input_size: u32,
    tracks: IouTracker,
    device: &'static str,
}

impl OnnxTracker {
    /// Load the model and its labels. Called once at startup.
    pub fn load(config: &ModelConfig) -> Result<Self, TrackerError> {
        let names: Vec<String> = match &config.labels_path {
            Some(path) => {
                let text = std::fs::read_to_string(path).map_err(|e| {
                    TrackerError::ModelLoad(format!("labels {}: {}", path.display(), e))
                })?;
                text.lines()
                    .map(str::trim)
                    .filter(|line| !line.is_empty())
                    .map(String::from)
                    .collect()
            }
            None => COCO_LABELS.iter().map(|s| s.to_string()).collect(),
        };

        let (session, device) = Self::create_session(config)?;

        info!(
            model = %config.path,
            labels = names.len(),
            input_size = config.input_size,
            device,
            "Detection model loaded"
        );

        Ok(Self {
            session,
            names: Arc::new(names),
            input_size: config.input_size,
            tracks: IouTracker::default(),
            device,
        })
    }

    /// Execution device the session ended up on.
    pub fn device(&self) -> &'static str {
        self.device
    }

    fn create_session(config: &ModelConfig) -> Result<(Session, &'static str), TrackerError> {
        if config.use_gpu {
            #[cfg(feature = "cuda")]
            match Self::create_cuda_session(config) {
                Ok(session) => return Ok((session, "cuda")),
                Err(e) => warn!(error = %e, "CUDA is not available, falling back to CPU"),
            }

            #[cfg(not(feature = "cuda"))]
            warn!("Built without GPU support, falling back to CPU");
        }

        let session = Session::builder()
            .map_err(|e| TrackerError::ModelLoad(e.to_string()))?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(|e| TrackerError::ModelLoad(e.to_string()))?
            .commit_from_file(&config.path)
            .map_err(|e| TrackerError::ModelLoad(format!("{}: {}", config.path, e)))?;

        Ok((session, "cpu"))
    }

    #[cfg(feature = "cuda")]
    fn create_cuda_session(config: &ModelConfig) -> Result<Session, TrackerError> {
        use ort::execution_providers::CUDAExecutionProvider;

        Session::builder()
            .map_err(|e| TrackerError::ModelLoad(e.to_string()))?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(|e| TrackerError::ModelLoad(e.to_string()))?
            .with_execution_providers([CUDAExecutionProvider::default()
                .with_device_id(config.device_id)
                .build()
                .error_on_failure()])
            .map_err(|e| TrackerError::ModelLoad(format!("CUDA provider failed: {}", e)))?
            .commit_from_file(&config.path)
            .map_err(|e| TrackerError::ModelLoad(format!("{}: {}", config.path, e)))
    }

    /// Resize to the model input and lay out as normalized NCHW.
    fn preprocess(&self, frame: &RgbImage) -> Array<f32, ndarray::IxDyn> {
        let size = self.input_size;
        let resized = image::imageops::resize(frame, size, size, FilterType::Triangle);

        let side = size as usize;
        let mut input = Array::zeros((1, 3, side, side));
        for (x, y, pixel) in resized.enumerate_pixels() {
            let (x, y) = (x as usize, y as usize);
            input[[0, 0, y, x]] = pixel[0] as f32 / 255.0;
            input[[0, 1, y, x]] = pixel[1] as f32 / 255.0;
            input[[0, 2, y, x]] = pixel[2] as f32 / 255.0;
        }
        input.into_dyn()
    }

    fn postprocess(
        &self,
        output: ArrayViewD<f32>,
        params: &TrackParams,
    ) -> Result<Vec<Candidate>, TrackerError> {
        let shape = output.shape();
        if shape.len() != 3 || shape[1] < 5 {
            return Err(TrackerError::Postprocessing(format!(
                "Unexpected output shape: {:?}",
                shape
            )));
        }

        let num_classes = shape[1] - 4;
        let num_boxes = shape[2];
        let scale = self.input_size as f32;
        let mut candidates = Vec::new();

        for i in 0..num_boxes {
            let mut best_class = 0;
            let mut best_score = 0.0f32;
            for c in 0..num_classes {
                let score = output[[0, 4 + c, i]];
                if score > best_score {
                    best_score = score;
                    best_class = c;
                }
            }

            if best_score < params.confidence {
                continue;
            }

            candidates.push(Candidate {
                xywhn: [
                    output[[0, 0, i]] / scale,
                    output[[0, 1, i]] / scale,
                    output[[0, 2, i]] / scale,
                    output[[0, 3, i]] / scale,
                ],
                class_id: best_class,
                confidence: best_score,
            });
        }

        Ok(non_max_suppression(candidates, params.iou))
    }
}

impl Tracker for OnnxTracker {
    fn reset(&mut self) {
        self.tracks.reset();
    }

    fn track(&mut self, frame: &RgbImage, params: &TrackParams) -> Result<TrackOutput, TrackerError> {
        let input = self.preprocess(frame);
        let tensor = TensorRef::from_array_view(&input)
            .map_err(|e| TrackerError::Preprocessing(e.to_string()))?;

        let outputs = self
            .session
            .run(ort::inputs![tensor])
            .map_err(|e| TrackerError::Inference(e.to_string()))?;

        let output = outputs[0]
            .try_extract_array::<f32>()
            .map_err(|e| TrackerError::Postprocessing(e.to_string()))?
            .into_owned();
        drop(outputs);

        let candidates = self.postprocess(output.view(), params)?;
        let track_ids = if params.persist {
            self.tracks.update(&candidates).into_iter().map(Some).collect()
        } else {
            vec![None; candidates.len()]
        };

        debug!(detections = candidates.len(), "Frame inference complete");

        let detections = candidates
            .into_iter()
            .zip(track_ids)
            .map(|(candidate, track_id)| RawDetection {
                xywhn: Some(candidate.xywhn),
                class_id: Some(candidate.class_id as i64),
                confidence: candidate.confidence,
                track_id,
            })
            .collect();

        Ok(TrackOutput {
            names: Arc::clone(&self.names),
            detections,
        })
    }

    fn plot(&self, frame: &RgbImage, output: &TrackOutput) -> RgbImage {
        let mut annotated = frame.clone();
        let (width, height) = (frame.width() as f32, frame.height() as f32);

        for detection in &output.detections {
            let Some(xywhn) = detection.xywhn else {
                continue;
            };
            let [x1, y1, x2, y2] = corners(&xywhn);
            let left = (x1 * width).clamp(0.0, width - 1.0) as i32;
            let top = (y1 * height).clamp(0.0, height - 1.0) as i32;
            let box_w = ((x2 - x1) * width).max(1.0) as u32;
            let box_h = ((y2 - y1) * height).max(1.0) as u32;

            let slot = detection
                .track_id
                .or(detection.class_id)
                .unwrap_or(0)
                .unsigned_abs() as usize;
            let color = Rgb(TRACK_PALETTE[slot % TRACK_PALETTE.len()]);

            for inset in 0..2u32 {
                if box_w > 2 * inset && box_h > 2 * inset {
                    let rect = Rect::at(left + inset as i32, top + inset as i32)
                        .of_size(box_w - 2 * inset, box_h - 2 * inset);
                    draw_hollow_rect_mut(&mut annotated, rect, color);
                }
            }
        }

        annotated
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(xywhn: [f32; 4], class_id: usize, confidence: f32) -> Candidate {
        Candidate {
            xywhn,
            class_id,
            confidence,
        }
    }

    #[test]
    fn test_iou() {
        let a = [0.5, 0.5, 0.2, 0.2];
        assert!((iou(&a, &a) - 1.0).abs() < 1e-6);
        assert_eq!(iou(&a, &[0.1, 0.1, 0.1, 0.1]), 0.0);

        let shifted = [0.6, 0.5, 0.2, 0.2];
        let expected = 0.02 / 0.06;
        assert!((iou(&a, &shifted) - expected).abs() < 1e-5);
    }

    #[test]
    fn test_nms_is_class_wise() {
        let kept = non_max_suppression(
            vec![
                candidate([0.5, 0.5, 0.2, 0.2], 0, 0.6),
                candidate([0.51, 0.5, 0.2, 0.2], 0, 0.9),
                candidate([0.5, 0.5, 0.2, 0.2], 1, 0.5),
            ],
            0.5,
        );

        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].confidence, 0.9);
        assert_eq!(kept[1].class_id, 1);
    }

    #[test]
    fn test_tracks_persist_across_frames() {
        let mut tracker = IouTracker::default();

        let first = tracker.update(&[candidate([0.20, 0.5, 0.1, 0.2], 0, 0.9)]);
        let second = tracker.update(&[candidate([0.22, 0.5, 0.1, 0.2], 0, 0.9)]);
        let third = tracker.update(&[
            candidate([0.24, 0.5, 0.1, 0.2], 0, 0.9),
            candidate([0.80, 0.5, 0.1, 0.2], 0, 0.8),
        ]);

        assert_eq!(first, vec![1]);
        assert_eq!(second, vec![1]);
        assert_eq!(third, vec![1, 2]);
    }

    #[test]
    fn test_tracks_expire_and_reset() {
        let mut tracker = IouTracker::default();
        tracker.update(&[candidate([0.2, 0.5, 0.1, 0.2], 0, 0.9)]);

        for _ in 0..=TRACK_MAX_AGE {
            tracker.update(&[]);
        }
        assert!(tracker.tracks.is_empty());

        tracker.reset();
        assert_eq!(tracker.update(&[candidate([0.2, 0.5, 0.1, 0.2], 0, 0.9)]), vec![1]);
    }

    #[test]
    fn test_coco_labels() {
        assert_eq!(COCO_LABELS[0], "person");
        assert_eq!(COCO_LABELS[79], "toothbrush");
    }
}
