use bytes::Bytes;
use image::{
    codecs::jpeg::JpegEncoder,
    imageops::{self, FilterType},
    RgbImage,
};
use thiserror::Error;

use crate::camera::{CameraError, CaptureSource, RawFrame};

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("Camera error: {0}")]
    Camera(#[from] CameraError),
    #[error("Frame buffer of {len} bytes does not hold a {width}x{height} RGB image")]
    InvalidBuffer { width: u32, height: u32, len: usize },
    #[error("Failed to encode frame: {0}")]
    EncodeFrameFailed(#[from] image::ImageError),
}

/// Draws frames onto a fixed-size canvas and compresses them to JPEG, so the
/// server always sees the same resolution whatever the camera delivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameEncoder {
    width: u32,
    height: u32,
    quality: u8,
}

impl FrameEncoder {
    pub fn new(width: u32, height: u32, quality: u8) -> Self {
        Self {
            width: width.max(1),
            height: height.max(1),
            quality: quality.clamp(1, 100),
        }
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn encode(&self, frame: RawFrame) -> Result<Bytes, FrameError> {
        let RawFrame {
            width,
            height,
            pixels,
        } = frame;
        let len = pixels.len();
        let image = RgbImage::from_raw(width, height, pixels).ok_or(FrameError::InvalidBuffer {
            width,
            height,
            len,
        })?;

        let canvas = if image.dimensions() == (self.width, self.height) {
            image
        } else {
            imageops::resize(&image, self.width, self.height, FilterType::Triangle)
        };

        let mut buf = Vec::new();
        JpegEncoder::new_with_quality(&mut buf, self.quality).encode_image(&canvas)?;
        Ok(Bytes::from(buf))
    }
}

/// Grabs the current frame from `source` and encodes it. Blocking.
pub fn capture_jpeg(
    source: &dyn CaptureSource,
    encoder: &FrameEncoder,
) -> Result<Option<Bytes>, FrameError> {
    match source.capture_frame()? {
        Some(frame) => encoder.encode(frame).map(Some),
        None => Ok(None),
    }
}
