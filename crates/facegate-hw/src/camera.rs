//! V4L2 webcam capture via the `v4l` crate.

use crate::frame;
use facegate_core::{CameraOpener, CaptureError, FrameSource};
use image::GrayImage;
use std::path::Path;
use thiserror::Error;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

const CAPTURE_WIDTH: u32 = 640;
const CAPTURE_HEIGHT: u32 = 480;
const STREAM_BUFFERS: u32 = 4;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("device busy")]
    DeviceBusy,
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("streaming not supported")]
    StreamingNotSupported,
}

impl From<CameraError> for CaptureError {
    fn from(e: CameraError) -> Self {
        match e {
            CameraError::CaptureFailed(msg) => CaptureError::Frame(msg),
            other => CaptureError::Unavailable(other.to_string()),
        }
    }
}

/// Negotiated pixel format for the camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// YUYV 4:2:2 packed (2 bytes/pixel, Y channel kept).
    Yuyv,
    /// 8-bit grayscale.
    Grey,
}

/// An open V4L2 capture device. Dropping it releases the device.
///
/// The mmap stream starts on the first capture and stays on until the
/// camera is dropped or a dequeue fails.
pub struct Camera {
    stream: Option<MmapStream<'static>>,
    device: Device,
    pub width: u32,
    pub height: u32,
    pub device_path: String,
    pixel_format: PixelFormat,
    mirror: bool,
}

impl Camera {
    /// Open a V4L2 device by path (e.g., "/dev/video0").
    pub fn open(device_path: &str, mirror: bool) -> Result<Self, CameraError> {
        if !Path::new(device_path).exists() {
            return Err(CameraError::DeviceNotFound(device_path.to_string()));
        }

        let device = Device::with_path(device_path).map_err(|e| {
            if e.to_string().contains("busy") || e.to_string().contains("EBUSY") {
                CameraError::DeviceBusy
            } else {
                CameraError::DeviceNotFound(format!("{device_path}: {e}"))
            }
        })?;

        let caps = device.query_caps().map_err(|e| {
            CameraError::CaptureFailed(format!("failed to query capabilities: {e}"))
        })?;
        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            return Err(CameraError::StreamingNotSupported);
        }

        let mut fmt = device.format().map_err(|e| {
            CameraError::FormatNegotiationFailed(format!("failed to get format: {e}"))
        })?;
        fmt.fourcc = FourCC::new(b"YUYV");
        fmt.width = CAPTURE_WIDTH;
        fmt.height = CAPTURE_HEIGHT;

        let negotiated = device.set_format(&fmt).map_err(|e| {
            CameraError::FormatNegotiationFailed(format!("failed to set format: {e}"))
        })?;

        let pixel_format = if negotiated.fourcc == FourCC::new(b"YUYV") {
            PixelFormat::Yuyv
        } else if negotiated.fourcc == FourCC::new(b"GREY") {
            PixelFormat::Grey
        } else {
            return Err(CameraError::FormatNegotiationFailed(format!(
                "unsupported pixel format: {:?} (need YUYV or GREY)",
                negotiated.fourcc
            )));
        };

        tracing::info!(
            device = device_path,
            card = %caps.card,
            width = negotiated.width,
            height = negotiated.height,
            format = ?pixel_format,
            "camera opened"
        );

        Ok(Self {
            stream: None,
            device,
            width: negotiated.width,
            height: negotiated.height,
            device_path: device_path.to_string(),
            pixel_format,
            mirror,
        })
    }

    /// Capture one frame as a grayscale image.
    pub fn capture_frame(&mut self) -> Result<GrayImage, CameraError> {
        let device = &self.device;
        let stream = ensure_stream(&mut self.stream, || {
            tracing::debug!(device = %self.device_path, "starting mmap stream");
            MmapStream::with_buffers(device, BufType::VideoCapture, STREAM_BUFFERS).map_err(|e| {
                CameraError::CaptureFailed(format!("failed to create mmap stream: {e}"))
            })
        })?;

        let converted = match stream.next() {
            Ok((buf, meta)) => {
                tracing::trace!(seq = meta.sequence, bytes = buf.len(), "frame dequeued");
                match self.pixel_format {
                    PixelFormat::Yuyv => frame::yuyv_to_gray(buf, self.width, self.height),
                    PixelFormat::Grey => frame::grey_to_gray(buf, self.width, self.height),
                }
            }
            Err(e) => {
                // Restart streaming on the next capture.
                self.stream = None;
                return Err(CameraError::CaptureFailed(format!("failed to dequeue buffer: {e}")));
            }
        };
        let mut image = converted.map_err(|e| CameraError::CaptureFailed(e.to_string()))?;

        if self.mirror {
            frame::mirror(&mut image);
        }
        Ok(image)
    }
}

/// Return the running stream, starting one with `start` if there is none.
fn ensure_stream<'s, S, E>(
    slot: &'s mut Option<S>,
    start: impl FnOnce() -> Result<S, E>,
) -> Result<&'s mut S, E> {
    match slot {
        Some(stream) => Ok(stream),
        None => Ok(slot.insert(start()?)),
    }
}

impl Drop for Camera {
    fn drop(&mut self) {
        tracing::debug!(device = %self.device_path, "camera released");
    }
}

impl FrameSource for Camera {
    fn next_frame(&mut self) -> Result<GrayImage, CaptureError> {
        self.capture_frame().map_err(CaptureError::from)
    }
}

/// Opens the configured device each time the gate (re)acquires the camera.
#[derive(Debug, Clone)]
pub struct V4lOpener {
    device_path: String,
    mirror: bool,
}

impl V4lOpener {
    pub fn new(device_path: impl Into<String>, mirror: bool) -> Self {
        Self {
            device_path: device_path.into(),
            mirror,
        }
    }
}

impl CameraOpener for V4lOpener {
    type Source = Camera;

    fn open(&self) -> Result<Camera, CaptureError> {
        Camera::open(&self.device_path, self.mirror).map_err(|e| match e {
            CameraError::CaptureFailed(msg) => CaptureError::Unavailable(msg),
            other => CaptureError::from(other),
        })
    }
}
