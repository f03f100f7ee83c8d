//! ArcFace descriptor extraction from a detected face region.

use facegate_core::{BoundingBox, Descriptor};
use image::{imageops, imageops::FilterType, GrayImage};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const INPUT_SIZE: u32 = 112;
const PIXEL_MEAN: f32 = 127.5;
const PIXEL_STD: f32 = 127.5;
/// Fraction of the box size added on each side before cropping.
const CROP_MARGIN: f32 = 0.1;

#[derive(Error, Debug)]
pub enum EmbedderError {
    #[error("embedder model not found: {0}")]
    ModelNotFound(String),
    #[error("face region lies outside the frame")]
    EmptyCrop,
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

pub struct ArcFaceEmbedder {
    session: Session,
}

impl ArcFaceEmbedder {
    pub fn load(model_path: &Path) -> Result<Self, EmbedderError> {
        if !model_path.exists() {
            return Err(EmbedderError::ModelNotFound(model_path.display().to_string()));
        }
        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;
        tracing::info!(path = %model_path.display(), "loaded ArcFace model");
        Ok(Self { session })
    }

    /// Compute the unit-length descriptor of the face inside `bbox`.
    pub fn embed(&mut self, frame: &GrayImage, bbox: &BoundingBox) -> Result<Descriptor, EmbedderError> {
        let face = crop_face(frame, bbox).ok_or(EmbedderError::EmptyCrop)?;
        let input = to_tensor(&face);

        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| EmbedderError::InferenceFailed(e.to_string()))?;
        if raw.is_empty() {
            return Err(EmbedderError::InferenceFailed("empty embedding".into()));
        }

        Ok(Descriptor::new(l2_normalize(raw)))
    }
}

/// Square crop around the box, clamped to the frame, scaled to the model input.
fn crop_face(frame: &GrayImage, bbox: &BoundingBox) -> Option<GrayImage> {
    let side = bbox.width.max(bbox.height) * (1.0 + 2.0 * CROP_MARGIN);
    let cx = bbox.x + bbox.width / 2.0;
    let cy = bbox.y + bbox.height / 2.0;

    let x0 = (cx - side / 2.0).max(0.0);
    let y0 = (cy - side / 2.0).max(0.0);
    let x1 = (cx + side / 2.0).min(frame.width() as f32);
    let y1 = (cy + side / 2.0).min(frame.height() as f32);
    if !(x1 - x0 >= 1.0 && y1 - y0 >= 1.0) {
        return None;
    }

    let region = imageops::crop_imm(
        frame,
        x0 as u32,
        y0 as u32,
        (x1 - x0) as u32,
        (y1 - y0) as u32,
    )
    .to_image();
    Some(imageops::resize(&region, INPUT_SIZE, INPUT_SIZE, FilterType::Triangle))
}

fn to_tensor(face: &GrayImage) -> Array4<f32> {
    let size = INPUT_SIZE as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    for (x, y, pixel) in face.enumerate_pixels() {
        let v = (pixel[0] as f32 - PIXEL_MEAN) / PIXEL_STD;
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = v;
        }
    }
    tensor
}

fn l2_normalize(raw: &[f32]) -> Vec<f32> {
    let norm = raw.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        raw.iter().map(|v| v / norm).collect()
    } else {
        raw.to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    fn bbox(x: f32, y: f32, w: f32, h: f32) -> BoundingBox {
        BoundingBox {
            x,
            y,
            width: w,
            height: h,
            confidence: 0.9,
        }
    }

    #[test]
    fn test_crop_face_is_model_sized() {
        let frame = GrayImage::from_pixel(640, 480, Luma([50]));
        let face = crop_face(&frame, &bbox(100.0, 100.0, 80.0, 120.0)).unwrap();
        assert_eq!(face.dimensions(), (INPUT_SIZE, INPUT_SIZE));
        assert!(face.pixels().all(|p| p[0] == 50));
    }

    #[test]
    fn test_crop_face_clamps_to_frame() {
        let frame = GrayImage::from_pixel(64, 64, Luma([9]));
        assert!(crop_face(&frame, &bbox(-20.0, -20.0, 40.0, 40.0)).is_some());
        assert!(crop_face(&frame, &bbox(500.0, 500.0, 40.0, 40.0)).is_none());
    }

    #[test]
    fn test_to_tensor_replicates_gray() {
        let face = GrayImage::from_pixel(INPUT_SIZE, INPUT_SIZE, Luma([255]));
        let tensor = to_tensor(&face);
        assert_eq!(tensor.shape(), &[1, 3, 112, 112]);
        assert_eq!(tensor[[0, 0, 5, 7]], 1.0);
        assert_eq!(tensor[[0, 1, 5, 7]], tensor[[0, 2, 5, 7]]);
    }

    #[test]
    fn test_l2_normalize() {
        let v = l2_normalize(&[3.0, 4.0]);
        assert!((v[0] - 0.6).abs() < 1e-6 && (v[1] - 0.8).abs() < 1e-6);
        assert_eq!(l2_normalize(&[0.0, 0.0]), vec![0.0, 0.0]);
    }
}
