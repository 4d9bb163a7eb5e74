use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use thiserror::Error;
use tracing::info;

use crate::config::{CameraBackend, CameraConfig};

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("Camera access denied: {0}")]
    PermissionDenied(String),
    #[error("No camera available: {0}")]
    Unavailable(String),
    #[error("Capture source is not running")]
    NotCapturing,
    #[error("Failed to read frame: {0}")]
    ReadFrameFailed(String),
    #[cfg(feature = "opencv")]
    #[error("OpenCV error: {0}")]
    OpenCvError(#[from] opencv::Error),
}

/// One captured picture as tightly packed RGB8 pixels.
#[derive(Debug, Clone, PartialEq)]
pub struct RawFrame {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

/// A live video source. Capturing may block, so callers run it off the async
/// executor.
pub trait CaptureSource: Send + Sync {
    /// `Ok(None)` means the device had no frame ready yet.
    fn capture_frame(&self) -> Result<Option<RawFrame>, CameraError>;
    fn is_live(&self) -> bool;
    /// Stops every track of the source. Safe to call more than once.
    fn stop(&self);
}

/// Hands out capture sources, asking the platform for camera access.
pub trait CameraProvider: Send + Sync {
    fn acquire(&self) -> Result<Arc<dyn CaptureSource>, CameraError>;
}

/// Replays a single image file as if it were a camera.
#[derive(Debug)]
pub struct StillImageCamera {
    frame: RawFrame,
    live: AtomicBool,
}

impl StillImageCamera {
    pub fn open(path: &Path) -> Result<Self, CameraError> {
        let image = image::open(path).map_err(|e| match e {
            image::ImageError::IoError(io) if io.kind() == std::io::ErrorKind::PermissionDenied => {
                CameraError::PermissionDenied(format!("{}: {io}", path.display()))
            }
            other => CameraError::Unavailable(format!("{}: {other}", path.display())),
        })?;
        Ok(Self::from_frame(rgb_frame(image.to_rgb8())))
    }

    pub fn from_frame(frame: RawFrame) -> Self {
        Self {
            frame,
            live: AtomicBool::new(true),
        }
    }
}

fn rgb_frame(image: image::RgbImage) -> RawFrame {
    RawFrame {
        width: image.width(),
        height: image.height(),
        pixels: image.into_raw(),
    }
}

impl CaptureSource for StillImageCamera {
    fn capture_frame(&self) -> Result<Option<RawFrame>, CameraError> {
        if !self.is_live() {
            return Err(CameraError::NotCapturing);
        }
        Ok(Some(self.frame.clone()))
    }

    fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    fn stop(&self) {
        self.live.store(false, Ordering::Release);
    }
}

#[cfg(feature = "opencv")]
pub use self::device::OpenCvCamera;

#[cfg(feature = "opencv")]
mod device {
    use super::{CameraError, CaptureSource, RawFrame};
    use opencv::{core::Mat, imgproc, prelude::*, videoio};
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    pub struct OpenCvCamera {
        capture: Mutex<videoio::VideoCapture>,
        live: AtomicBool,
    }

    impl OpenCvCamera {
        pub fn open(index: i32) -> Result<Self, CameraError> {
            let capture = videoio::VideoCapture::new(index, videoio::CAP_ANY)
                .map_err(|e| CameraError::Unavailable(e.to_string()))?;
            if !capture.is_opened()? {
                return Err(CameraError::Unavailable(format!(
                    "video device {index} could not be opened"
                )));
            }
            Ok(Self {
                capture: Mutex::new(capture),
                live: AtomicBool::new(true),
            })
        }
    }

    impl CaptureSource for OpenCvCamera {
        fn capture_frame(&self) -> Result<Option<RawFrame>, CameraError> {
            if !self.is_live() {
                return Err(CameraError::NotCapturing);
            }
            let mut cam = self.capture.lock();
            let mut frame = Mat::default();
            let grabbed = cam
                .read(&mut frame)
                .map_err(|e| CameraError::ReadFrameFailed(e.to_string()))?;
            if !grabbed || frame.empty() {
                return Ok(None);
            }

            let mut rgb = Mat::default();
            imgproc::cvt_color_def(&frame, &mut rgb, imgproc::COLOR_BGR2RGB)?;
            Ok(Some(RawFrame {
                width: rgb.cols() as u32,
                height: rgb.rows() as u32,
                pixels: rgb.data_bytes()?.to_vec(),
            }))
        }

        fn is_live(&self) -> bool {
            self.live.load(Ordering::Acquire)
        }

        fn stop(&self) {
            if self.live.swap(false, Ordering::AcqRel) {
                if let Err(e) = self.capture.lock().release() {
                    tracing::warn!("Failed to release video device: {e}");
                }
            }
        }
    }
}

/// Opens the capture backend named in the configuration.
#[derive(Debug, Clone)]
pub struct DeviceCameraProvider {
    config: CameraConfig,
}

impl DeviceCameraProvider {
    pub fn new(config: CameraConfig) -> Self {
        Self { config }
    }

    fn image_path(&self) -> Result<&PathBuf, CameraError> {
        self.config.image_path.as_ref().ok_or_else(|| {
            CameraError::Unavailable("camera.image_path is not configured".to_string())
        })
    }
}

impl CameraProvider for DeviceCameraProvider {
    fn acquire(&self) -> Result<Arc<dyn CaptureSource>, CameraError> {
        match self.config.backend {
            CameraBackend::StillImage => {
                let path = self.image_path()?;
                info!(path = %path.display(), "Opening still image capture source");
                Ok(Arc::new(StillImageCamera::open(path)?))
            }
            #[cfg(feature = "opencv")]
            CameraBackend::Opencv => {
                info!(device = self.config.device_index, "Opening OpenCV camera");
                Ok(Arc::new(OpenCvCamera::open(self.config.device_index)?))
            }
            #[cfg(not(feature = "opencv"))]
            CameraBackend::Opencv => Err(CameraError::Unavailable(
                "built without the `opencv` feature".to_string(),
            )),
        }
    }
}
