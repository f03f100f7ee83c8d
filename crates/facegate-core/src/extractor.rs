//! Face detection and descriptor extraction, as seen by the core.

use crate::types::Detection;
use image::GrayImage;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExtractorError {
    #[error("model not available: {0}")]
    ModelUnavailable(String),
    #[error("extraction failed: {0}")]
    Failed(String),
}

/// Given an image, produce one [`Detection`] per face found.
///
/// Implementations keep no state between calls that affects results.
/// All descriptors from one extractor share the same dimensionality.
pub trait DescriptorExtractor {
    fn detect(&mut self, image: &GrayImage) -> Result<Vec<Detection>, ExtractorError>;
}
