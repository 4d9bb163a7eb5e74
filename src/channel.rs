//! Persistent duplex message channel with an explicit state machine.
//!
//! A [`SessionChannel`] wraps one [`Transport`] and never reconnects. Its
//! closure is reported exactly once: either as the return value of the first
//! [`SessionChannel::close`] call, or as [`ChannelEvent::Closed`] from
//! [`SessionChannel::next_event`], whichever comes first.

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    #[error("Failed to connect to {endpoint}: {reason}")]
    Connect { endpoint: String, reason: String },
    #[error("Transport failure: {0}")]
    Io(String),
}

#[derive(Error, Debug, Clone, PartialEq)]
#[error("Failed to open channel to {endpoint}: {reason}")]
pub struct ConnectError {
    pub endpoint: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Text(String),
    Binary(Bytes),
}

impl Frame {
    pub fn len(&self) -> usize {
        match self {
            Frame::Text(text) => text.len(),
            Frame::Binary(data) => data.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// What a transport hands back from a read.
#[derive(Debug, Clone, PartialEq)]
pub enum Received {
    Frame(Frame),
    Closed { code: Option<u16>, reason: String },
}

#[async_trait]
pub trait Transport: Send {
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError>;
    /// Must be cancel safe: it is raced against timers and shutdown signals.
    async fn recv(&mut self) -> Result<Received, TransportError>;
    async fn close(&mut self) -> Result<(), TransportError>;
}

#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Transport: Transport + 'static;

    async fn connect(&self, endpoint: &str) -> Result<Self::Transport, TransportError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Idle,
    Connecting,
    Open,
    Closing,
    Closed,
    Errored,
}

impl ChannelState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ChannelState::Closed | ChannelState::Errored)
    }

    fn can_transition_to(self, next: ChannelState) -> bool {
        use ChannelState::*;
        match (self, next) {
            (Idle, Connecting) | (Connecting, Open) | (Closing, Closed) => true,
            (Idle | Connecting | Open, Closing) => true,
            (from, Errored) => !from.is_terminal(),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CloseReason {
    /// Closed by this side.
    Local,
    /// Closed by the server or the network without an error.
    Remote { code: Option<u16>, reason: String },
    /// Torn down by a transport failure.
    Failed(String),
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Local => write!(f, "closed locally"),
            CloseReason::Remote { code: Some(code), reason } if !reason.is_empty() => {
                write!(f, "closed by server ({code}: {reason})")
            }
            CloseReason::Remote { code: Some(code), .. } => write!(f, "closed by server ({code})"),
            CloseReason::Remote { .. } => write!(f, "closed by server"),
            CloseReason::Failed(error) => write!(f, "connection error: {error}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Message(Frame),
    Closed(CloseReason),
}

pub struct SessionChannel<T> {
    endpoint: String,
    state: ChannelState,
    transport: Option<T>,
    pending_close: Option<CloseReason>,
    close_reported: bool,
}

impl<T: Transport> SessionChannel<T> {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            state: ChannelState::Idle,
            transport: None,
            pending_close: None,
            close_reported: false,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == ChannelState::Open
    }

    /// Opens the channel. A failed attempt leaves the channel `Errored`; the
    /// returned error is its one and only close notification.
    pub async fn connect<C>(&mut self, connector: &C) -> Result<(), ConnectError>
    where
        C: Connector<Transport = T>,
    {
        if self.state != ChannelState::Idle {
            return Err(ConnectError {
                endpoint: self.endpoint.clone(),
                reason: format!("channel is already {:?}", self.state),
            });
        }
        self.transition(ChannelState::Connecting);

        match connector.connect(&self.endpoint).await {
            Ok(transport) => {
                self.transport = Some(transport);
                self.transition(ChannelState::Open);
                Ok(())
            }
            Err(e) => {
                warn!(endpoint = %self.endpoint, "Failed to open channel: {e}");
                self.transition(ChannelState::Errored);
                self.close_reported = true;
                Err(ConnectError {
                    endpoint: self.endpoint.clone(),
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Sends a frame if the channel is open. Anything else drops the frame and
    /// returns `false`; no error is raised.
    pub async fn send(&mut self, frame: Frame) -> bool {
        if self.state != ChannelState::Open {
            debug!(endpoint = %self.endpoint, state = ?self.state, "Dropping outbound frame");
            return false;
        }
        let Some(transport) = self.transport.as_mut() else {
            return false;
        };
        match transport.send(frame).await {
            Ok(()) => true,
            Err(e) => {
                warn!(endpoint = %self.endpoint, "Send failed: {e}");
                self.fail(e.to_string());
                false
            }
        }
    }

    /// Waits for the next inbound frame or for the channel to close. Returns
    /// `None` once the closure has been reported.
    pub async fn next_event(&mut self) -> Option<ChannelEvent> {
        if let Some(reason) = self.pending_close.take() {
            self.close_reported = true;
            return Some(ChannelEvent::Closed(reason));
        }
        if self.close_reported || self.state != ChannelState::Open {
            return None;
        }
        let transport = self.transport.as_mut()?;

        match transport.recv().await {
            Ok(Received::Frame(frame)) => Some(ChannelEvent::Message(frame)),
            Ok(Received::Closed { code, reason }) => {
                self.transition(ChannelState::Closing);
                if let Some(mut transport) = self.transport.take() {
                    if let Err(e) = transport.close().await {
                        debug!(endpoint = %self.endpoint, "Ignoring close handshake error: {e}");
                    }
                }
                self.transition(ChannelState::Closed);
                self.close_reported = true;
                Some(ChannelEvent::Closed(CloseReason::Remote { code, reason }))
            }
            Err(e) => {
                warn!(endpoint = %self.endpoint, "Receive failed: {e}");
                self.fail(e.to_string());
                self.pending_close.take().map(|reason| {
                    self.close_reported = true;
                    ChannelEvent::Closed(reason)
                })
            }
        }
    }

    /// Closes the channel. Idempotent: only the first call that actually
    /// reports the closure returns `Some`.
    pub async fn close(&mut self) -> Option<CloseReason> {
        if self.close_reported {
            return None;
        }
        if let Some(reason) = self.pending_close.take() {
            self.close_reported = true;
            return Some(reason);
        }

        self.transition(ChannelState::Closing);
        if let Some(mut transport) = self.transport.take() {
            if let Err(e) = transport.close().await {
                debug!(endpoint = %self.endpoint, "Ignoring close handshake error: {e}");
            }
        }
        self.transition(ChannelState::Closed);
        self.close_reported = true;
        Some(CloseReason::Local)
    }

    fn fail(&mut self, error: String) {
        self.transition(ChannelState::Errored);
        self.transport = None;
        if !self.close_reported && self.pending_close.is_none() {
            self.pending_close = Some(CloseReason::Failed(error));
        }
    }

    fn transition(&mut self, next: ChannelState) {
        if self.state.can_transition_to(next) {
            debug!(endpoint = %self.endpoint, from = ?self.state, to = ?next, "Channel state transition");
            self.state = next;
        } else {
            warn!(
                endpoint = %self.endpoint,
                "Invalid channel transition from {:?} to {:?}",
                self.state,
                next
            );
        }
    }
}
