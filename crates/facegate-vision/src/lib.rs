//! ONNX-backed [`DescriptorExtractor`](facegate_core::DescriptorExtractor).

pub mod detector;
pub mod embedder;
pub mod extractor;

pub use detector::{DetectorError, ScrfdDetector};
pub use embedder::{ArcFaceEmbedder, EmbedderError};
pub use extractor::{OnnxExtractor, DETECTOR_MODEL, EMBEDDER_MODEL};
