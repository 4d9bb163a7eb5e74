use std::sync::Arc;
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::camera::{CameraError, CameraProvider, CaptureSource};
use crate::channel::{ConnectError, Connector};
use crate::stream::PreviewSink;
use crate::streamer::{InferenceStreamer, StreamerError};

#[derive(Error, Debug)]
pub enum LifecycleError {
    #[error("Camera permission denied: {0}")]
    Permission(CameraError),
    #[error("Camera unavailable: {0}")]
    Device(CameraError),
    #[error(transparent)]
    Connect(#[from] ConnectError),
}

impl From<CameraError> for LifecycleError {
    fn from(e: CameraError) -> Self {
        match e {
            CameraError::PermissionDenied(_) => LifecycleError::Permission(e),
            other => LifecycleError::Device(other),
        }
    }
}

impl From<StreamerError> for LifecycleError {
    fn from(e: StreamerError) -> Self {
        match e {
            StreamerError::Device(e) => e.into(),
            StreamerError::Connect(e) => LifecycleError::Connect(e),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    Idle,
    /// Camera runs and feeds the preview, but no inference stream is live.
    Previewing,
    Streaming,
}

/// Glues camera acquisition, the preview sink and the inference streamer
/// into one start/stop pair.
pub struct CaptureLifecycle<C: Connector> {
    provider: Arc<dyn CameraProvider>,
    preview: PreviewSink,
    streamer: InferenceStreamer<C>,
    source: Option<Arc<dyn CaptureSource>>,
}

impl<C: Connector> CaptureLifecycle<C> {
    pub fn new(
        provider: Arc<dyn CameraProvider>,
        preview: PreviewSink,
        streamer: InferenceStreamer<C>,
    ) -> Self {
        Self {
            provider,
            preview,
            streamer,
            source: None,
        }
    }

    pub fn state(&self) -> CaptureState {
        match (&self.source, self.streamer.is_streaming()) {
            (None, _) => CaptureState::Idle,
            (Some(_), true) => CaptureState::Streaming,
            (Some(_), false) => CaptureState::Previewing,
        }
    }

    pub fn streamer(&self) -> &InferenceStreamer<C> {
        &self.streamer
    }

    /// Acquires the camera, shows it in the preview and starts live inference.
    ///
    /// A failed channel open leaves the camera and preview running and
    /// returns [`LifecycleError::Connect`].
    #[instrument(skip(self))]
    pub async fn start_camera(&mut self) -> Result<(), LifecycleError> {
        if self.source.is_some() {
            info!("Capture already running, restarting");
            self.stop_camera().await;
        }

        let provider = self.provider.clone();
        let source = tokio::task::spawn_blocking(move || provider.acquire())
            .await
            .map_err(|e| LifecycleError::Device(CameraError::Unavailable(e.to_string())))??;

        self.preview.bind(source.clone());
        self.source = Some(source.clone());
        info!("Camera started");

        if let Err(e) = self.streamer.start(source).await {
            warn!("Live inference not started: {e}");
            return Err(e.into());
        }
        Ok(())
    }

    /// Stops inference, unbinds the preview and releases the camera.
    pub async fn stop_camera(&mut self) {
        self.streamer.stop().await;
        self.preview.unbind();
        if let Some(source) = self.source.take() {
            source.stop();
            info!("Camera stopped");
        }
    }
}
