use std::time::Instant;

use crate::capture::Frame;
use crate::error::DetectError;

/// Axis-aligned box in frame pixel coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
    pub label: String,
    pub score: f32,
}

impl BoundingBox {
    pub fn new(x: f32, y: f32, w: f32, h: f32, label: impl Into<String>, score: f32) -> Self {
        Self {
            x,
            y,
            w,
            h,
            label: label.into(),
            score,
        }
    }

    pub fn area(&self) -> f32 {
        self.w.max(0.0) * self.h.max(0.0)
    }

    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let left = self.x.max(other.x);
        let top = self.y.max(other.y);
        let right = (self.x + self.w).min(other.x + other.w);
        let bottom = (self.y + self.h).min(other.y + other.h);
        let inter = (right - left).max(0.0) * (bottom - top).max(0.0);
        let union = self.area() + other.area() - inter;
        if union <= 0.0 {
            0.0
        } else {
            inter / union
        }
    }
}

/// Published outcome of one inference call.
///
/// Only built through [`DetectionResult::from_raw`], which drops boxes under
/// the confidence threshold.
#[derive(Debug, Clone)]
pub struct DetectionResult {
    boxes: Vec<BoundingBox>,
    /// Sequence number of the frame the boxes were computed from.
    pub sequence: u64,
    pub computed_at: Instant,
}

impl DetectionResult {
    pub fn from_raw(sequence: u64, mut boxes: Vec<BoundingBox>, threshold: f32) -> Self {
        boxes.retain(|b| b.score >= threshold);
        // Highest score first; the order is what the overlay draws in.
        boxes.sort_by(|a, b| b.score.total_cmp(&a.score));
        Self {
            boxes,
            sequence,
            computed_at: Instant::now(),
        }
    }

    pub fn boxes(&self) -> &[BoundingBox] {
        &self.boxes
    }

    pub fn len(&self) -> usize {
        self.boxes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.boxes.is_empty()
    }
}

/// Object detector capability: frame in, scored boxes out.
///
/// Calls are made from a blocking worker thread and may take longer than the
/// detection interval. Several calls may overlap when the scheduler allows more
/// than one in flight.
pub trait Detector: Send + Sync {
    fn name(&self) -> &'static str;

    fn detect(&self, frame: &Frame) -> Result<Vec<BoundingBox>, DetectError>;

    /// Optional warm-up hook.
    fn warm_up(&self) -> Result<(), DetectError> {
        Ok(())
    }
}
