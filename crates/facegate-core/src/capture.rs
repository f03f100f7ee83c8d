//! Camera collaborator traits.
//!
//! The camera is an exclusively owned resource: [`CameraOpener::open`]
//! acquires it and dropping the returned [`FrameSource`] releases it.

use image::GrayImage;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("camera unavailable: {0}")]
    Unavailable(String),
    #[error("frame capture failed: {0}")]
    Frame(String),
}

/// A live stream of grayscale frames.
pub trait FrameSource {
    /// Block until the next frame is available.
    ///
    /// A [`CaptureError::Frame`] is transient; callers retry.
    fn next_frame(&mut self) -> Result<GrayImage, CaptureError>;
}

/// Acquires the camera on demand.
pub trait CameraOpener {
    type Source: FrameSource;

    fn open(&self) -> Result<Self::Source, CaptureError>;
}
