//! Follows a background training job over its progress channel.

use std::{fmt, str::FromStr, sync::Arc};
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tracing::{debug, info, instrument, warn};

use crate::channel::{ChannelEvent, CloseReason, ConnectError, Connector, SessionChannel, Transport};
use crate::config::ServiceConfig;
use crate::protocol::{decode_training, ProtocolError, TrainingMessage};
use crate::telemetry::Metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TrainingStatus {
    Running,
    Completed,
    Errored,
}

impl TrainingStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, TrainingStatus::Running)
    }
}

impl FromStr for TrainingStatus {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "starting" | "training" | "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "error" | "errored" | "failed" => Ok(Self::Errored),
            _ => Err(ProtocolError::UnknownStatus(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrainingProgress {
    pub current_epoch: u32,
    pub total_epochs: u32,
    pub log: String,
    pub status: TrainingStatus,
}

impl TrainingProgress {
    /// Share of epochs done, once the job knows how many it will run.
    pub fn percent(&self) -> Option<f32> {
        (self.total_epochs > 0)
            .then(|| self.current_epoch as f32 / self.total_epochs as f32 * 100.0)
    }
}

/// Rejects snapshots that move a session backwards.
#[derive(Debug, Default)]
pub struct ProgressTracker {
    last: Option<(u32, TrainingStatus)>,
}

impl ProgressTracker {
    pub fn accept(&mut self, next: &TrainingProgress) -> Result<(), ProtocolError> {
        if let Some((epoch, status)) = self.last {
            if next.current_epoch < epoch {
                return Err(ProtocolError::EpochRegressed {
                    previous: epoch,
                    current: next.current_epoch,
                });
            }
            if status.is_terminal() && next.status != status {
                return Err(ProtocolError::StatusRegressed {
                    from: status,
                    to: next.status,
                });
            }
        }
        self.last = Some((next.current_epoch, next.status));
        Ok(())
    }
}

/// Why a monitored training session ended. Whatever comes first wins; the
/// session never reports a second ending.
#[derive(Debug, Clone, PartialEq)]
pub enum TrainingEnd {
    Completed(TrainingProgress),
    Failed(TrainingProgress),
    ServerError(String),
    Protocol(ProtocolError),
    Closed(CloseReason),
    Detached,
}

impl TrainingEnd {
    pub fn is_completed(&self) -> bool {
        matches!(self, TrainingEnd::Completed(_))
    }
}

impl fmt::Display for TrainingEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrainingEnd::Completed(progress) => write!(f, "Training completed: {}", progress.log),
            TrainingEnd::Failed(progress) => write!(f, "Training failed: {}", progress.log),
            TrainingEnd::ServerError(error) => write!(f, "Training error: {error}"),
            TrainingEnd::Protocol(error) => write!(f, "Training monitor error: {error}"),
            TrainingEnd::Closed(reason) => write!(f, "Training monitor {reason}"),
            TrainingEnd::Detached => write!(f, "Training monitor detached"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TrainingEvent {
    Progress(TrainingProgress),
    Ended(TrainingEnd),
}

struct ActiveMonitor {
    session_id: String,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// Attaches to one training session at a time and reports its progress on an
/// event channel. Every successful [`TrainingMonitor::attach`] produces
/// exactly one [`TrainingEvent::Ended`].
pub struct TrainingMonitor<C: Connector> {
    connector: Arc<C>,
    service: ServiceConfig,
    events: mpsc::UnboundedSender<TrainingEvent>,
    metrics: Option<Arc<Metrics>>,
    active: Option<ActiveMonitor>,
}

impl<C: Connector> TrainingMonitor<C> {
    pub fn new(
        connector: Arc<C>,
        service: ServiceConfig,
        events: mpsc::UnboundedSender<TrainingEvent>,
    ) -> Self {
        Self {
            connector,
            service,
            events,
            metrics: None,
            active: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// True while the session is still delivering events.
    pub fn is_attached(&self) -> bool {
        self.active
            .as_ref()
            .is_some_and(|active| !active.task.is_finished())
    }

    pub fn session_id(&self) -> Option<&str> {
        self.active.as_ref().map(|active| active.session_id.as_str())
    }

    #[instrument(skip(self))]
    pub async fn attach(&mut self, session_id: &str) -> Result<(), ConnectError> {
        if self.active.is_some() {
            warn!("Already monitoring a training session, detaching it first");
            self.detach().await;
        }

        let endpoint = self
            .service
            .training_endpoint(session_id)
            .map_err(|e| ConnectError {
                endpoint: self.service.base_url.clone(),
                reason: e.to_string(),
            })?;
        let mut channel = SessionChannel::new(endpoint.as_str());
        channel.connect(self.connector.as_ref()).await?;
        info!("Attached to training session");

        let (shutdown, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(run_monitor(
            channel,
            self.events.clone(),
            self.metrics.clone(),
            shutdown_rx,
        ));
        self.active = Some(ActiveMonitor {
            session_id: session_id.to_string(),
            shutdown,
            task,
        });
        Ok(())
    }

    /// Closes the channel. Once this returns no further events are sent for
    /// the session. Calling it again, or before any attach, does nothing.
    pub async fn detach(&mut self) {
        let Some(active) = self.active.take() else {
            return;
        };
        let _ = active.shutdown.send(());
        if let Err(e) = active.task.await {
            warn!(session_id = %active.session_id, "Training monitor task failed: {e}");
        }
        debug!(session_id = %active.session_id, "Training monitor detached");
    }
}

async fn run_monitor<T: Transport>(
    mut channel: SessionChannel<T>,
    events: mpsc::UnboundedSender<TrainingEvent>,
    metrics: Option<Arc<Metrics>>,
    mut shutdown: oneshot::Receiver<()>,
) {
    let mut tracker = ProgressTracker::default();

    let end = loop {
        tokio::select! {
            _ = &mut shutdown => {
                channel.close().await;
                break TrainingEnd::Detached;
            }
            event = channel.next_event() => match event {
                Some(ChannelEvent::Message(frame)) => {
                    let progress = match decode_training(&frame) {
                        Ok(TrainingMessage::Progress(progress)) => progress,
                        Ok(TrainingMessage::ServerError(error)) => {
                            channel.close().await;
                            break TrainingEnd::ServerError(error);
                        }
                        Err(e) => {
                            channel.close().await;
                            break TrainingEnd::Protocol(e);
                        }
                    };
                    if let Err(e) = tracker.accept(&progress) {
                        channel.close().await;
                        break TrainingEnd::Protocol(e);
                    }
                    if let Some(metrics) = &metrics {
                        metrics.record_training_epoch(progress.current_epoch);
                    }
                    debug!(
                        epoch = progress.current_epoch,
                        total = progress.total_epochs,
                        "Training progress"
                    );
                    let _ = events.send(TrainingEvent::Progress(progress.clone()));

                    match progress.status {
                        TrainingStatus::Running => {}
                        TrainingStatus::Completed => {
                            channel.close().await;
                            break TrainingEnd::Completed(progress);
                        }
                        TrainingStatus::Errored => {
                            channel.close().await;
                            break TrainingEnd::Failed(progress);
                        }
                    }
                }
                Some(ChannelEvent::Closed(reason)) => break TrainingEnd::Closed(reason),
                None => break TrainingEnd::Closed(CloseReason::Local),
            }
        }
    };

    match &end {
        TrainingEnd::Completed(_) | TrainingEnd::Detached => info!("{end}"),
        TrainingEnd::Closed(CloseReason::Remote { .. }) => info!("{end}"),
        _ => warn!("{end}"),
    }
    let _ = events.send(TrainingEvent::Ended(end));
}
