//! Streams camera frames to the inference endpoint and folds the replies into
//! a live [`ConfidenceModel`].
//!
//! Each running stream is one task that owns the channel, the capture timer
//! and the model together, so none of them can outlive the others. Frames are
//! never queued: a tick that finds the channel closed, or an encode still in
//! flight, is dropped.

use bytes::Bytes;
use std::{
    fmt,
    sync::Arc,
    time::{Duration, Instant},
};
use thiserror::Error;
use tokio::{
    sync::{mpsc, oneshot, watch},
    task::{JoinError, JoinHandle},
    time::MissedTickBehavior,
};
use tracing::{debug, info, instrument, trace, warn};

use crate::camera::{CameraError, CaptureSource};
use crate::channel::{
    ChannelEvent, CloseReason, ConnectError, Connector, Frame, SessionChannel, Transport,
};
use crate::confidence::{ConfidenceModel, ConfidenceReport};
use crate::frame::{capture_jpeg, FrameEncoder, FrameError};
use crate::protocol::{decode_inference, InferenceMessage, ProtocolError};
use crate::telemetry::Metrics;

#[derive(Error, Debug)]
pub enum StreamerError {
    #[error("Capture device error: {0}")]
    Device(#[from] CameraError),
    #[error(transparent)]
    Connect(#[from] ConnectError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamerConfig {
    pub frame_interval: Duration,
    pub frame_width: u32,
    pub frame_height: u32,
    pub jpeg_quality: u8,
}

impl Default for StreamerConfig {
    fn default() -> Self {
        Self {
            frame_interval: Duration::from_millis(200),
            frame_width: 640,
            frame_height: 480,
            jpeg_quality: 80,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamEnd {
    Stopped,
    Closed(CloseReason),
    ServerError(String),
    Protocol(ProtocolError),
}

impl fmt::Display for StreamEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamEnd::Stopped => write!(f, "Live inference stopped"),
            StreamEnd::Closed(reason) => write!(f, "Inference channel {reason}"),
            StreamEnd::ServerError(error) => write!(f, "Inference error: {error}"),
            StreamEnd::Protocol(error) => write!(f, "Inference protocol error: {error}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// Channel is open; waiting for the class manifest.
    Connected,
    Manifest(Vec<String>),
    Prediction(ConfidenceReport),
    Ended(StreamEnd),
}

impl StreamEvent {
    /// One-line status for the user.
    pub fn status_line(&self) -> String {
        match self {
            StreamEvent::Connected => "Connected to server, waiting for data...".to_string(),
            StreamEvent::Manifest(labels) => {
                format!("Sending video frames for {} classes...", labels.len())
            }
            StreamEvent::Prediction(report) => match &report.top {
                Some(top) => format!("Prediction: {top}"),
                None => "Prediction: -".to_string(),
            },
            StreamEvent::Ended(end) => end.to_string(),
        }
    }
}

/// How long [`InferenceStreamer::stop`] waits for the stream task to close
/// its channel before aborting it.
pub const STOP_GRACE: Duration = Duration::from_millis(500);

struct ActiveStream {
    source: Arc<dyn CaptureSource>,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

pub struct InferenceStreamer<C: Connector> {
    connector: Arc<C>,
    endpoint: String,
    config: StreamerConfig,
    events: mpsc::UnboundedSender<StreamEvent>,
    report: Arc<watch::Sender<ConfidenceReport>>,
    metrics: Option<Arc<Metrics>>,
    active: Option<ActiveStream>,
}

impl<C: Connector> InferenceStreamer<C> {
    pub fn new(
        connector: Arc<C>,
        endpoint: impl Into<String>,
        config: StreamerConfig,
        events: mpsc::UnboundedSender<StreamEvent>,
    ) -> Self {
        let (report, _) = watch::channel(ConfidenceReport::default());
        Self {
            connector,
            endpoint: endpoint.into(),
            config,
            events,
            report: Arc::new(report),
            metrics: None,
            active: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Latest confidence report; reset to empty when the stream stops.
    pub fn confidences(&self) -> watch::Receiver<ConfidenceReport> {
        self.report.subscribe()
    }

    pub fn is_started(&self) -> bool {
        self.active.is_some()
    }

    /// True while frames are flowing.
    pub fn is_streaming(&self) -> bool {
        self.active
            .as_ref()
            .is_some_and(|active| !active.task.is_finished())
    }

    #[instrument(skip(self, source), fields(endpoint = %self.endpoint))]
    pub async fn start(&mut self, source: Arc<dyn CaptureSource>) -> Result<(), StreamerError> {
        if self.is_streaming() {
            warn!("Inference stream already running, ignoring start");
            return Ok(());
        }
        // A stream that ended on its own still holds its finished task and source.
        if let Some(finished) = self.active.take() {
            if !std::ptr::addr_eq(Arc::as_ptr(&finished.source), Arc::as_ptr(&source)) {
                finished.source.stop();
            }
            if let Err(e) = finished.task.await {
                warn!("Inference stream task failed: {e}");
            }
        }

        if !source.is_live() {
            return Err(StreamerError::Device(CameraError::NotCapturing));
        }

        let mut channel = SessionChannel::new(self.endpoint.clone());
        channel.connect(self.connector.as_ref()).await?;
        info!("Inference channel open");
        let _ = self.events.send(StreamEvent::Connected);

        let (shutdown, shutdown_rx) = oneshot::channel();
        let task = StreamTask {
            channel,
            source: source.clone(),
            encoder: FrameEncoder::new(
                self.config.frame_width,
                self.config.frame_height,
                self.config.jpeg_quality,
            ),
            events: self.events.clone(),
            report: self.report.clone(),
            metrics: self.metrics.clone(),
        };
        let task = tokio::spawn(task.run(self.config.frame_interval, shutdown_rx));

        self.active = Some(ActiveStream {
            source,
            shutdown,
            task,
        });
        Ok(())
    }

    /// Stops the capture source, then the timer and the channel, and clears
    /// the confidences. A task that does not wind down within [`STOP_GRACE`]
    /// is aborted.
    pub async fn stop(&mut self) {
        if let Some(active) = self.active.take() {
            active.source.stop();
            let _ = active.shutdown.send(());
            let mut task = active.task;
            match tokio::time::timeout(STOP_GRACE, &mut task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Inference stream task failed: {e}"),
                Err(_) => {
                    warn!("Inference stream did not stop within {STOP_GRACE:?}, aborting");
                    task.abort();
                    match task.await {
                        Err(e) if e.is_cancelled() => {
                            let _ = self.events.send(StreamEvent::Ended(StreamEnd::Stopped));
                        }
                        Err(e) => warn!("Inference stream task failed: {e}"),
                        Ok(()) => {}
                    }
                }
            }
            info!("Inference stream stopped");
        }
        self.report.send_replace(ConfidenceReport::default());
    }
}

type EncodeJob = JoinHandle<Result<Option<(Bytes, Duration)>, FrameError>>;

struct StreamTask<T> {
    channel: SessionChannel<T>,
    source: Arc<dyn CaptureSource>,
    encoder: FrameEncoder,
    events: mpsc::UnboundedSender<StreamEvent>,
    report: Arc<watch::Sender<ConfidenceReport>>,
    metrics: Option<Arc<Metrics>>,
}

impl<T: Transport> StreamTask<T> {
    async fn run(mut self, frame_interval: Duration, mut shutdown: oneshot::Receiver<()>) {
        let mut ticker = tokio::time::interval(frame_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut model = ConfidenceModel::new();
        let mut in_flight: Option<EncodeJob> = None;

        let end = loop {
            tokio::select! {
                _ = &mut shutdown => {
                    self.channel.close().await;
                    break StreamEnd::Stopped;
                }
                _ = ticker.tick() => self.on_tick(&mut in_flight),
                encoded = wait_for(&mut in_flight) => {
                    in_flight = None;
                    let Some((jpeg, elapsed)) = self.on_encoded(encoded) else {
                        continue;
                    };
                    let size = jpeg.len();
                    // A peer that stops reading must not hold up shutdown.
                    tokio::select! {
                        _ = &mut shutdown => {
                            self.channel.close().await;
                            break StreamEnd::Stopped;
                        }
                        sent = self.channel.send(Frame::Binary(jpeg)) => {
                            if sent {
                                self.on_sent(size, elapsed);
                            }
                        }
                    }
                }
                event = self.channel.next_event() => match event {
                    Some(ChannelEvent::Message(frame)) => {
                        if let Err(end) = self.on_message(&mut model, &frame) {
                            self.channel.close().await;
                            break end;
                        }
                    }
                    Some(ChannelEvent::Closed(reason)) => break StreamEnd::Closed(reason),
                    None => break StreamEnd::Closed(CloseReason::Local),
                }
            }
        };

        // Whatever is still encoding resolves into a closed channel and is discarded.
        drop(in_flight);
        model.reset();
        self.report.send_replace(ConfidenceReport::default());

        match &end {
            StreamEnd::Stopped | StreamEnd::Closed(CloseReason::Remote { .. }) => info!("{end}"),
            _ => warn!("{end}"),
        }
        let _ = self.events.send(StreamEvent::Ended(end));
    }

    fn on_tick(&self, in_flight: &mut Option<EncodeJob>) {
        if !self.channel.is_open() {
            trace!("Channel not open, dropping tick");
            self.dropped("channel_not_open");
            return;
        }
        if in_flight.is_some() {
            trace!("Previous frame still encoding, dropping tick");
            self.dropped("encoder_busy");
            return;
        }

        let source = self.source.clone();
        let encoder = self.encoder;
        *in_flight = Some(tokio::task::spawn_blocking(move || {
            let started = Instant::now();
            let jpeg = capture_jpeg(source.as_ref(), &encoder)?;
            Ok(jpeg.map(|jpeg| (jpeg, started.elapsed())))
        }));
    }

    /// Returns the frame to send, or `None` if it was discarded.
    fn on_encoded(
        &self,
        result: Result<Result<Option<(Bytes, Duration)>, FrameError>, JoinError>,
    ) -> Option<(Bytes, Duration)> {
        match result {
            Ok(Ok(Some(encoded))) => {
                if !self.channel.is_open() {
                    trace!("Channel left open state while encoding, discarding frame");
                    self.dropped("stale");
                    return None;
                }
                Some(encoded)
            }
            Ok(Ok(None)) => {
                trace!("Capture source had no frame ready");
                None
            }
            Ok(Err(e)) => {
                warn!("Failed to capture frame: {e}");
                self.dropped("capture_failed");
                None
            }
            Err(e) => {
                warn!("Frame encode task failed: {e}");
                None
            }
        }
    }

    fn on_sent(&self, size: usize, elapsed: Duration) {
        trace!(bytes = size, "Frame sent");
        if let Some(metrics) = &self.metrics {
            metrics.record_frame_sent(elapsed.as_millis() as u64);
        }
    }

    fn on_message(&self, model: &mut ConfidenceModel, frame: &Frame) -> Result<(), StreamEnd> {
        let messages = decode_inference(frame).map_err(StreamEnd::Protocol)?;

        for message in messages {
            match message {
                InferenceMessage::ServerError(error) => return Err(StreamEnd::ServerError(error)),
                InferenceMessage::Manifest(labels) => {
                    model
                        .apply_manifest(labels)
                        .map_err(|e| StreamEnd::Protocol(e.into()))?;
                    debug!(classes = model.len(), "Received class manifest");
                    self.report.send_replace(model.report());
                    let _ = self
                        .events
                        .send(StreamEvent::Manifest(model.labels().to_vec()));
                }
                InferenceMessage::Confidences(confidences) => {
                    model
                        .merge(&confidences)
                        .map_err(|e| StreamEnd::Protocol(e.into()))?;
                    if let Some(metrics) = &self.metrics {
                        metrics.record_confidence_update();
                    }
                    let report = model.report();
                    self.report.send_replace(report.clone());
                    let _ = self.events.send(StreamEvent::Prediction(report));
                }
            }
        }
        Ok(())
    }

    fn dropped(&self, reason: &'static str) {
        if let Some(metrics) = &self.metrics {
            metrics.record_frame_dropped(reason);
        }
    }
}

async fn wait_for<R>(job: &mut Option<JoinHandle<R>>) -> Result<R, JoinError> {
    match job {
        Some(handle) => handle.await,
        None => std::future::pending().await,
    }
}
