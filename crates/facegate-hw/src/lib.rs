//! facegate-hw — Webcam access for the access gate.
//!
//! Opens a V4L2 capture device, converts each buffer to a grayscale
//! image and exposes the device through the core's camera traits.

pub mod camera;
pub mod frame;

pub use camera::{Camera, CameraError, PixelFormat, V4lOpener};
