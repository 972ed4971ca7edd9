//! YOLO-style ONNX detector running on tract.
//!
//! Expects a single output tensor shaped `[1, 4 + classes, anchors]` with
//! centre-format boxes in model input pixels (the YOLOv8 export layout).

use std::path::Path;
use std::sync::Mutex;

use image::imageops::FilterType;
use image::RgbImage;
use tracing::info;
use tract_onnx::prelude::*;

use crate::capture::Frame;
use crate::config::DetectionConfig;
use crate::detect::detector::{BoundingBox, Detector};
use crate::error::DetectError;

type Plan = TypedRunnableModel<TypedModel>;

pub struct TractDetector {
    model: Mutex<Plan>,
    input_size: u32,
    confidence_threshold: f32,
    iou_threshold: f32,
    labels: Vec<String>,
}

impl TractDetector {
    /// Load an ONNX model from disk and prepare it for inference.
    pub fn load<P: AsRef<Path>>(model_path: P, config: &DetectionConfig) -> Result<Self, DetectError> {
        let model_path = model_path.as_ref();
        let size = config.input_size as usize;
        let backend = |stage: &str, e: TractError| {
            DetectError::Backend(format!("{stage} {}: {e}", model_path.display()))
        };

        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .map_err(|e| backend("failed to load ONNX model", e))?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(f32::datum_type(), tvec!(1, 3, size, size)),
            )
            .map_err(|e| backend("failed to set input fact for", e))?
            .into_optimized()
            .map_err(|e| backend("failed to optimize", e))?
            .into_runnable()
            .map_err(|e| backend("failed to build runnable", e))?;

        info!(
            "Loaded detector model {} ({}x{} input)",
            model_path.display(),
            size,
            size
        );

        Ok(Self {
            model: Mutex::new(model),
            input_size: config.input_size,
            confidence_threshold: config.confidence_threshold,
            iou_threshold: config.iou_threshold,
            labels: config.labels.clone(),
        })
    }

    fn build_input(&self, frame: &Frame) -> Result<Tensor, DetectError> {
        let image = RgbImage::from_raw(frame.width(), frame.height(), frame.data.to_vec())
            .ok_or_else(|| DetectError::Input {
                width: frame.width(),
                height: frame.height(),
                reason: "pixel buffer shorter than its dimensions".into(),
            })?;
        let size = self.input_size;
        let resized = image::imageops::resize(&image, size, size, FilterType::Triangle);

        let size = size as usize;
        let input = tract_ndarray::Array4::from_shape_fn((1, 3, size, size), |(_, channel, y, x)| {
            resized.get_pixel(x as u32, y as u32)[channel] as f32 / 255.0
        });
        Ok(input.into_tensor())
    }

    fn label(&self, class: usize) -> String {
        self.labels
            .get(class)
            .cloned()
            .unwrap_or_else(|| format!("class{class}"))
    }

    fn decode(&self, output: &Tensor, frame: &Frame) -> Result<Vec<BoundingBox>, DetectError> {
        let view = output
            .to_array_view::<f32>()
            .map_err(|e| DetectError::Backend(format!("model output was not f32: {e}")))?;
        let shape = view.shape().to_vec();
        if shape.len() != 3 || shape[0] != 1 || shape[1] < 5 {
            return Err(DetectError::Backend(format!("unexpected output shape {shape:?}")));
        }
        let view = view
            .into_dimensionality::<tract_ndarray::Ix3>()
            .map_err(|e| DetectError::Backend(format!("unexpected output shape: {e}")))?;
        let (channels, anchors) = (shape[1], shape[2]);
        let sx = frame.width() as f32 / self.input_size as f32;
        let sy = frame.height() as f32 / self.input_size as f32;

        let mut candidates = Vec::new();
        for i in 0..anchors {
            let (class, score) = (4..channels)
                .map(|c| (c - 4, view[[0, c, i]]))
                .fold((0, f32::MIN), |best, cur| if cur.1 > best.1 { cur } else { best });
            if score < self.confidence_threshold {
                continue;
            }
            let (cx, cy, w, h) = (view[[0, 0, i]], view[[0, 1, i]], view[[0, 2, i]], view[[0, 3, i]]);
            candidates.push((
                class,
                BoundingBox::new((cx - w / 2.0) * sx, (cy - h / 2.0) * sy, w * sx, h * sy, self.label(class), score),
            ));
        }
        Ok(non_max_suppression(candidates, self.iou_threshold))
    }
}

/// Greedy per-class non-maximum suppression.
fn non_max_suppression(mut candidates: Vec<(usize, BoundingBox)>, iou_threshold: f32) -> Vec<BoundingBox> {
    candidates.sort_by(|a, b| b.1.score.total_cmp(&a.1.score));
    let mut kept: Vec<(usize, BoundingBox)> = Vec::new();
    for (class, candidate) in candidates {
        let overlaps = kept
            .iter()
            .any(|(k, b)| *k == class && b.iou(&candidate) > iou_threshold);
        if !overlaps {
            kept.push((class, candidate));
        }
    }
    kept.into_iter().map(|(_, b)| b).collect()
}

impl Detector for TractDetector {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn detect(&self, frame: &Frame) -> Result<Vec<BoundingBox>, DetectError> {
        let input = self.build_input(frame)?;
        let outputs = {
            let model = self
                .model
                .lock()
                .map_err(|_| DetectError::Backend("model lock poisoned".into()))?;
            model
                .run(tvec!(input.into()))
                .map_err(|e| DetectError::Backend(format!("ONNX inference failed: {e}")))?
        };
        let output = outputs
            .first()
            .ok_or_else(|| DetectError::Backend("model produced no outputs".into()))?;
        self.decode(output, frame)
    }

    fn warm_up(&self) -> Result<(), DetectError> {
        let size = self.input_size as usize;
        let zeros = tract_ndarray::Array4::<f32>::zeros((1, 3, size, size)).into_tensor();
        let model = self
            .model
            .lock()
            .map_err(|_| DetectError::Backend("model lock poisoned".into()))?;
        model
            .run(tvec!(zeros.into()))
            .map(|_| ())
            .map_err(|e| DetectError::Backend(format!("warm-up inference failed: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nms_suppresses_overlaps_within_a_class_only() {
        let boxes = vec![
            (0, BoundingBox::new(0.0, 0.0, 10.0, 10.0, "a", 0.9)),
            (0, BoundingBox::new(1.0, 1.0, 10.0, 10.0, "a", 0.8)),
            (1, BoundingBox::new(1.0, 1.0, 10.0, 10.0, "b", 0.7)),
            (0, BoundingBox::new(50.0, 50.0, 10.0, 10.0, "a", 0.6)),
        ];
        let kept = non_max_suppression(boxes, 0.45);
        let scores: Vec<f32> = kept.iter().map(|b| b.score).collect();
        assert_eq!(scores, vec![0.9, 0.7, 0.6]);
    }
}
