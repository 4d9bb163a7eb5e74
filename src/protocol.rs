//! JSON messages exchanged on the inference and training channels.

use serde::Deserialize;
use std::collections::HashMap;
use thiserror::Error;

use crate::channel::Frame;
use crate::confidence::ConfidenceError;
use crate::training::{TrainingProgress, TrainingStatus};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolError {
    #[error("Malformed message: {0}")]
    Malformed(String),
    #[error("Unexpected binary message of {0} bytes")]
    UnexpectedBinary(usize),
    #[error("Message carries no recognised field")]
    Empty,
    #[error("Unknown training status `{0}`")]
    UnknownStatus(String),
    #[error("Epoch went backwards from {previous} to {current}")]
    EpochRegressed { previous: u32, current: u32 },
    #[error("Training status went backwards from {from:?} to {to:?}")]
    StatusRegressed {
        from: TrainingStatus,
        to: TrainingStatus,
    },
    #[error("Invalid confidence update: {0}")]
    Confidence(#[from] ConfidenceError),
}

#[derive(Debug, Clone, PartialEq)]
pub enum InferenceMessage {
    Manifest(Vec<String>),
    Confidences(HashMap<String, f32>),
    ServerError(String),
}

#[derive(Debug, Deserialize)]
struct RawInferenceMessage {
    class_names: Option<Vec<String>>,
    confidences: Option<HashMap<String, f32>>,
    error: Option<String>,
}

/// Decodes one inbound inference frame into the messages it carries, in the
/// order they must be applied. An `error` field overrides everything else.
pub fn decode_inference(frame: &Frame) -> Result<Vec<InferenceMessage>, ProtocolError> {
    let raw: RawInferenceMessage = parse_json(frame)?;

    if let Some(error) = raw.error {
        return Ok(vec![InferenceMessage::ServerError(error)]);
    }

    let mut messages = Vec::with_capacity(2);
    if let Some(class_names) = raw.class_names {
        messages.push(InferenceMessage::Manifest(class_names));
    }
    if let Some(confidences) = raw.confidences {
        messages.push(InferenceMessage::Confidences(confidences));
    }
    if messages.is_empty() {
        return Err(ProtocolError::Empty);
    }
    Ok(messages)
}

#[derive(Debug, Clone, PartialEq)]
pub enum TrainingMessage {
    Progress(TrainingProgress),
    ServerError(String),
}

#[derive(Debug, Deserialize)]
struct RawTrainingMessage {
    current_epoch: Option<u32>,
    total_epochs: Option<u32>,
    #[serde(default)]
    log: String,
    status: Option<String>,
    error: Option<String>,
}

pub fn decode_training(frame: &Frame) -> Result<TrainingMessage, ProtocolError> {
    let raw: RawTrainingMessage = parse_json(frame)?;

    if let Some(error) = raw.error {
        return Ok(TrainingMessage::ServerError(error));
    }

    let (Some(current_epoch), Some(total_epochs), Some(status)) =
        (raw.current_epoch, raw.total_epochs, raw.status)
    else {
        return Err(ProtocolError::Malformed(
            "progress snapshot needs current_epoch, total_epochs and status".into(),
        ));
    };

    Ok(TrainingMessage::Progress(TrainingProgress {
        current_epoch,
        total_epochs,
        log: raw.log,
        status: status.parse::<TrainingStatus>()?,
    }))
}

fn parse_json<T: for<'de> Deserialize<'de>>(frame: &Frame) -> Result<T, ProtocolError> {
    match frame {
        Frame::Text(text) => {
            serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))
        }
        Frame::Binary(data) => Err(ProtocolError::UnexpectedBinary(data.len())),
    }
}
