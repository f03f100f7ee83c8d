use crate::detector::{DetectorError, ScrfdDetector};
use crate::embedder::{ArcFaceEmbedder, EmbedderError};
use facegate_core::{DescriptorExtractor, Detection, ExtractorError};
use image::GrayImage;
use std::path::Path;

pub const DETECTOR_MODEL: &str = "det_10g.onnx";
pub const EMBEDDER_MODEL: &str = "w600k_r50.onnx";

/// SCRFD detection followed by one ArcFace embedding per face.
pub struct OnnxExtractor {
    detector: ScrfdDetector,
    embedder: ArcFaceEmbedder,
}

impl OnnxExtractor {
    /// Load both models from `model_dir`.
    pub fn load(model_dir: &Path) -> Result<Self, ExtractorError> {
        let detector = ScrfdDetector::load(&model_dir.join(DETECTOR_MODEL)).map_err(unavailable)?;
        let embedder = ArcFaceEmbedder::load(&model_dir.join(EMBEDDER_MODEL)).map_err(unavailable)?;
        Ok(Self { detector, embedder })
    }
}

fn unavailable(e: impl std::fmt::Display) -> ExtractorError {
    ExtractorError::ModelUnavailable(e.to_string())
}

impl From<DetectorError> for ExtractorError {
    fn from(e: DetectorError) -> Self {
        ExtractorError::Failed(e.to_string())
    }
}

impl From<EmbedderError> for ExtractorError {
    fn from(e: EmbedderError) -> Self {
        ExtractorError::Failed(e.to_string())
    }
}

impl DescriptorExtractor for OnnxExtractor {
    fn detect(&mut self, image: &GrayImage) -> Result<Vec<Detection>, ExtractorError> {
        let boxes = self.detector.detect(image)?;
        let mut detections = Vec::with_capacity(boxes.len());
        for bbox in boxes {
            match self.embedder.embed(image, &bbox) {
                Ok(descriptor) => detections.push(Detection { bbox, descriptor }),
                Err(EmbedderError::EmptyCrop) => {
                    tracing::debug!(?bbox, "face box outside frame, skipped");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(detections)
    }
}
