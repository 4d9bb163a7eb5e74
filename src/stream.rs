use crate::camera::{CameraError, CaptureSource};
use crate::frame::{capture_jpeg, FrameEncoder, FrameError};
use bytes::Bytes;
use futures::stream;
use parking_lot::RwLock;
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tokio::time::sleep;
use tracing::instrument;

const FRAME_BOUNDARY: &str = "frame";

/// Where the running camera is shown. The capture lifecycle binds a source
/// when the camera starts and unbinds it when it stops.
#[derive(Clone, Default)]
pub struct PreviewSink {
    source: Arc<RwLock<Option<Arc<dyn CaptureSource>>>>,
}

impl PreviewSink {
    pub fn bind(&self, source: Arc<dyn CaptureSource>) {
        *self.source.write() = Some(source);
    }

    pub fn unbind(&self) {
        self.source.write().take();
    }

    pub fn current(&self) -> Option<Arc<dyn CaptureSource>> {
        self.source.read().clone()
    }

    pub fn is_bound(&self) -> bool {
        self.source.read().is_some()
    }
}

#[derive(Clone)]
pub struct VideoStream {
    pub preview: PreviewSink,
    pub encoder: FrameEncoder,
    pub video_stream_delay: u64,
}

#[derive(Error, Debug)]
pub enum VideoStreamError {
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("Capture task failed: {0}")]
    Task(String),
    #[error("Http builder error: {0}")]
    HttpBuilderError(String),
}

impl VideoStream {
    pub fn new(preview: PreviewSink, encoder: FrameEncoder, video_stream_delay: u64) -> Self {
        Self {
            preview,
            encoder,
            video_stream_delay,
        }
    }

    /// Multipart MJPEG body of the bound camera. Ends when the camera is
    /// unbound or stopped.
    #[instrument(skip(self))]
    pub fn generate_stream(self) -> impl futures::Stream<Item = Result<Bytes, VideoStreamError>> {
        stream::unfold(self, |this| async move {
            loop {
                sleep(Duration::from_millis(this.video_stream_delay)).await;
                let source = this.preview.current()?;
                let encoder = this.encoder;
                let captured =
                    tokio::task::spawn_blocking(move || capture_jpeg(source.as_ref(), &encoder))
                        .await;

                match captured {
                    Ok(Ok(Some(frame))) => {
                        let part_header = format!(
                            "--{}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
                            FRAME_BOUNDARY,
                            frame.len()
                        );
                        let mut body = part_header.into_bytes();
                        body.extend_from_slice(&frame);
                        body.extend_from_slice(b"\r\n");
                        return Some((Ok(Bytes::from(body)), this));
                    }
                    Ok(Ok(None)) => continue,
                    Ok(Err(FrameError::Camera(CameraError::NotCapturing))) => return None,
                    Ok(Err(e)) => {
                        tracing::error!("Error getting frame: {:?}", e);
                        return Some((Err(VideoStreamError::from(e)), this));
                    }
                    Err(e) => return Some((Err(VideoStreamError::Task(e.to_string())), this)),
                }
            }
        })
    }
}
