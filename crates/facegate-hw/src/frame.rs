//! Raw buffer → grayscale image conversion.

use image::{imageops, GrayImage};

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("buffer too short: expected {expected} bytes, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
}

/// Convert packed YUYV (4:2:2) to grayscale by extracting the Y channel.
///
/// YUYV packs two pixels per 4 bytes: [Y0, U, Y1, V].
pub fn yuyv_to_gray(yuyv: &[u8], width: u32, height: u32) -> Result<GrayImage, FrameError> {
    let expected = (width * height * 2) as usize;
    if yuyv.len() < expected {
        return Err(FrameError::InvalidLength {
            expected,
            actual: yuyv.len(),
        });
    }
    let luma: Vec<u8> = yuyv[..expected].iter().step_by(2).copied().collect();
    gray_from_raw(luma, width, height)
}

/// Wrap an 8-bit grayscale buffer, ignoring trailing padding.
pub fn grey_to_gray(buf: &[u8], width: u32, height: u32) -> Result<GrayImage, FrameError> {
    let expected = (width * height) as usize;
    if buf.len() < expected {
        return Err(FrameError::InvalidLength {
            expected,
            actual: buf.len(),
        });
    }
    gray_from_raw(buf[..expected].to_vec(), width, height)
}

/// Flip left-right so the preview behaves like a mirror.
pub fn mirror(image: &mut GrayImage) {
    imageops::flip_horizontal_in_place(image);
}

fn gray_from_raw(data: Vec<u8>, width: u32, height: u32) -> Result<GrayImage, FrameError> {
    let actual = data.len();
    GrayImage::from_raw(width, height, data).ok_or(FrameError::InvalidLength {
        expected: (width * height) as usize,
        actual,
    })
}
