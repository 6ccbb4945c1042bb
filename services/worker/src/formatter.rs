//! Detection record formatting.
//!
//! Turns one frame of raw tracker output into normalized, label-filtered
//! [`DetectionRecord`]s. A malformed detection is skipped on its own; the
//! rest of the batch is always kept.

use crate::tracker::{RawDetection, TrackOutput};
use serde::ser::{SerializeMap, Serializer};
use serde::Serialize;
use thiserror::Error;
use tracing::warn;

/// A box in normalized frame coordinates with a top-left origin.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BoundingBox {
    pub height: f64,
    pub left: f64,
    pub top: f64,
    pub width: f64,
}

impl BoundingBox {
    /// Convert a normalized center box to a top-left box.
    pub fn from_center(x_center: f64, y_center: f64, width: f64, height: f64) -> Self {
        Self {
            height,
            left: x_center - width / 2.0,
            top: y_center - height / 2.0,
            width,
        }
    }
}

/// One retained object in one frame.
///
/// Serialized as `{"<label>": {"boundingBox": {...}, "index": n}, "timestamp": t}`.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectionRecord {
    pub label: String,
    pub bounding_box: BoundingBox,
    /// Track id when the backend supplied one, else the position in the batch
    pub index: i64,
    /// Frame sequence index
    pub timestamp: u64,
}

#[derive(Serialize)]
struct LabeledBox<'a> {
    #[serde(rename = "boundingBox")]
    bounding_box: &'a BoundingBox,
    index: i64,
}

impl Serialize for DetectionRecord {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut map = serializer.serialize_map(Some(2))?;
        map.serialize_entry(
            &self.label,
            &LabeledBox {
                bounding_box: &self.bounding_box,
                index: self.index,
            },
        )?;
        map.serialize_entry("timestamp", &self.timestamp)?;
        map.end()
    }
}

/// Why a single detection could not be formatted.
#[derive(Debug, Error, PartialEq)]
pub enum FormatError {
    #[error("detection {position} has no class id")]
    MissingClass { position: usize },

    #[error("detection {position} has class id {class_id} but only {known} labels are known")]
    UnknownClass {
        position: usize,
        class_id: i64,
        known: usize,
    },

    #[error("detection {position} has a non-finite box")]
    Malformed { position: usize },
}

/// Outcome of formatting one detection that did not fail.
#[derive(Debug, Clone, PartialEq)]
pub enum Formatted {
    Record(DetectionRecord),
    /// The backend produced no geometry for this object
    NoGeometry,
    /// The label did not match the active filter
    Filtered,
}

/// Format a single raw detection at `position` in its batch.
pub fn format_detection(
    position: usize,
    detection: &RawDetection,
    names: &[String],
    timestamp: u64,
    filter: Option<&str>,
) -> Result<Formatted, FormatError> {
    let Some([x_center, y_center, width, height]) = detection.xywhn else {
        return Ok(Formatted::NoGeometry);
    };

    if ![x_center, y_center, width, height].iter().all(|v| v.is_finite()) {
        return Err(FormatError::Malformed { position });
    }

    let class_id = detection
        .class_id
        .ok_or(FormatError::MissingClass { position })?;

    let label = usize::try_from(class_id)
        .ok()
        .and_then(|id| names.get(id))
        .ok_or(FormatError::UnknownClass {
            position,
            class_id,
            known: names.len(),
        })?;

    if filter.is_some_and(|wanted| wanted != label) {
        return Ok(Formatted::Filtered);
    }

    Ok(Formatted::Record(DetectionRecord {
        label: label.clone(),
        bounding_box: BoundingBox::from_center(
            x_center as f64,
            y_center as f64,
            width as f64,
            height as f64,
        ),
        index: detection.track_id.unwrap_or(position as i64),
        timestamp,
    }))
}

/// Format every detection of one frame, skipping the ones that fail.
///
/// Returns an empty list when nothing was detected or everything was filtered.
pub fn format_detections(
    output: &TrackOutput,
    timestamp: u64,
    filter: Option<&str>,
) -> Vec<DetectionRecord> {
    output
        .detections
        .iter()
        .enumerate()
        .filter_map(|(position, detection)| {
            match format_detection(position, detection, &output.names, timestamp, filter) {
                Ok(Formatted::Record(record)) => Some(record),
                Ok(Formatted::NoGeometry | Formatted::Filtered) => None,
                Err(e) => {
                    warn!(frame = timestamp, error = %e, "Skipping malformed detection");
                    None
                }
            }
        })
        .collect()
}
