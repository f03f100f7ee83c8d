//! SCRFD face detector.
//!
//! The frame is letterboxed into a square input, every stride's anchor grid
//! is decoded into boxes in frame coordinates, and overlapping boxes are
//! merged with greedy NMS.

use facegate_core::BoundingBox;
use image::{imageops, imageops::FilterType, GrayImage};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const INPUT_SIZE: u32 = 640;
const PIXEL_MEAN: f32 = 127.5;
const PIXEL_STD: f32 = 128.0;
const SCORE_THRESHOLD: f32 = 0.5;
const NMS_THRESHOLD: f32 = 0.4;
const STRIDES: [usize; 3] = [8, 16, 32];
const ANCHORS_PER_CELL: usize = 2;
/// Score, bbox and landmark tensors for each stride.
const MIN_OUTPUTS: usize = 9;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("detector model not found: {0}")]
    ModelNotFound(String),
    #[error("unexpected model outputs: {0}")]
    BadModel(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Maps letterboxed input coordinates back onto the source frame.
#[derive(Debug, Clone, Copy)]
struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

impl Letterbox {
    fn fit(width: u32, height: u32) -> Self {
        let scale = (INPUT_SIZE as f32 / width as f32).min(INPUT_SIZE as f32 / height as f32);
        let new_w = (width as f32 * scale).round();
        let new_h = (height as f32 * scale).round();
        Self {
            scale,
            pad_x: ((INPUT_SIZE as f32 - new_w) / 2.0).floor(),
            pad_y: ((INPUT_SIZE as f32 - new_h) / 2.0).floor(),
        }
    }

    fn resized_dims(&self, width: u32, height: u32) -> (u32, u32) {
        (
            ((width as f32 * self.scale).round() as u32).clamp(1, INPUT_SIZE),
            ((height as f32 * self.scale).round() as u32).clamp(1, INPUT_SIZE),
        )
    }

    fn to_frame(&self, x: f32, y: f32) -> (f32, f32) {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }
}

/// Per-stride positions of the (score, bbox) output tensors.
type StrideOutputs = [(usize, usize); 3];

pub struct ScrfdDetector {
    session: Session,
    outputs: StrideOutputs,
}

impl ScrfdDetector {
    pub fn load(model_path: &Path) -> Result<Self, DetectorError> {
        if !model_path.exists() {
            return Err(DetectorError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let names: Vec<String> = session
            .outputs()
            .iter()
            .map(|o| o.name().to_string())
            .collect();
        if names.len() < MIN_OUTPUTS {
            return Err(DetectorError::BadModel(format!(
                "expected at least {MIN_OUTPUTS} outputs, got {}",
                names.len()
            )));
        }
        let outputs = output_layout(&names);

        tracing::info!(path = %model_path.display(), ?outputs, "loaded SCRFD model");
        Ok(Self { session, outputs })
    }

    /// Detect faces, highest confidence first.
    pub fn detect(&mut self, frame: &GrayImage) -> Result<Vec<BoundingBox>, DetectorError> {
        let (width, height) = frame.dimensions();
        if width == 0 || height == 0 {
            return Ok(Vec::new());
        }
        let letterbox = Letterbox::fit(width, height);
        let input = to_tensor(frame, &letterbox);

        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut candidates = Vec::new();
        for (&stride, &(score_idx, bbox_idx)) in STRIDES.iter().zip(self.outputs.iter()) {
            let (_, scores) = outputs[score_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("scores@{stride}: {e}")))?;
            let (_, deltas) = outputs[bbox_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("bboxes@{stride}: {e}")))?;
            candidates.extend(decode_stride(scores, deltas, stride, &letterbox));
        }

        Ok(nms(candidates, NMS_THRESHOLD))
    }
}

/// Resolve tensor positions from names like `score_8` / `bbox_16`.
///
/// Exports with numeric names use the conventional order: scores for
/// strides 8/16/32, then bboxes, then landmarks.
fn output_layout(names: &[String]) -> StrideOutputs {
    let position = |kind: &str, stride: usize| {
        let wanted = format!("{kind}_{stride}");
        names.iter().position(|n| *n == wanted)
    };
    let mut layout = [(0, 3), (1, 4), (2, 5)];
    for (slot, &stride) in layout.iter_mut().zip(STRIDES.iter()) {
        match (position("score", stride), position("bbox", stride)) {
            (Some(score), Some(bbox)) => *slot = (score, bbox),
            _ => return [(0, 3), (1, 4), (2, 5)],
        }
    }
    layout
}

/// Letterbox the frame into a normalized NCHW tensor, gray replicated to RGB.
fn to_tensor(frame: &GrayImage, letterbox: &Letterbox) -> Array4<f32> {
    let (new_w, new_h) = letterbox.resized_dims(frame.width(), frame.height());
    let resized = imageops::resize(frame, new_w, new_h, FilterType::Triangle);

    let size = INPUT_SIZE as usize;
    // Padding normalizes to zero.
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    let (ox, oy) = (letterbox.pad_x as usize, letterbox.pad_y as usize);
    for (x, y, pixel) in resized.enumerate_pixels() {
        let (tx, ty) = (ox + x as usize, oy + y as usize);
        if tx >= size || ty >= size {
            continue;
        }
        let v = (pixel[0] as f32 - PIXEL_MEAN) / PIXEL_STD;
        for c in 0..3 {
            tensor[[0, c, ty, tx]] = v;
        }
    }
    tensor
}

fn decode_stride(
    scores: &[f32],
    deltas: &[f32],
    stride: usize,
    letterbox: &Letterbox,
) -> Vec<BoundingBox> {
    let grid = INPUT_SIZE as usize / stride;
    let step = stride as f32;

    scores
        .iter()
        .take(grid * grid * ANCHORS_PER_CELL)
        .enumerate()
        .filter(|(_, score)| **score > SCORE_THRESHOLD)
        .filter_map(|(idx, &score)| {
            let d = deltas.get(idx * 4..idx * 4 + 4)?;
            let cell = idx / ANCHORS_PER_CELL;
            let cx = (cell % grid) as f32 * step;
            let cy = (cell / grid) as f32 * step;

            let (x1, y1) = letterbox.to_frame(cx - d[0] * step, cy - d[1] * step);
            let (x2, y2) = letterbox.to_frame(cx + d[2] * step, cy + d[3] * step);
            Some(BoundingBox {
                x: x1,
                y: y1,
                width: x2 - x1,
                height: y2 - y1,
                confidence: score,
            })
        })
        .collect()
}

/// Greedy non-maximum suppression; output is sorted by confidence.
fn nms(mut boxes: Vec<BoundingBox>, iou_threshold: f32) -> Vec<BoundingBox> {
    boxes.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    let mut kept: Vec<BoundingBox> = Vec::with_capacity(boxes.len());
    for candidate in boxes {
        if kept.iter().all(|k| iou(k, &candidate) <= iou_threshold) {
            kept.push(candidate);
        }
    }
    kept
}

fn iou(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let ix = ((a.x + a.width).min(b.x + b.width) - a.x.max(b.x)).max(0.0);
    let iy = ((a.y + a.height).min(b.y + b.height) - a.y.max(b.y)).max(0.0);
    let inter = ix * iy;
    let union = a.width * a.height + b.width * b.height - inter;
    if union > 0.0 {
        inter / union
    } else {
        0.0
    }
}
