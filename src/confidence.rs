//! Live per-class confidence scores for one inference session.
//!
//! The key set is fixed by the manifest the server sends when a stream opens.
//! Later updates can only change the scores of labels that are already known.

use serde::Serialize;
use std::{collections::HashMap, fmt};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfidenceError {
    #[error("Manifest contains an empty class label")]
    EmptyLabel,
    #[error("Manifest lists class `{0}` more than once")]
    DuplicateLabel(String),
    #[error("Confidence update received before any class manifest")]
    NoManifest,
    #[error("Confidence update names unknown class `{0}`")]
    UnknownClass(String),
    #[error("Confidence {value} for class `{label}` is outside [0, 1]")]
    OutOfRange { label: String, value: f32 },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfidenceModel {
    labels: Vec<String>,
    scores: HashMap<String, f32>,
}

impl ConfidenceModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the whole key set. Every class starts at zero confidence.
    pub fn apply_manifest(&mut self, labels: Vec<String>) -> Result<(), ConfidenceError> {
        let mut scores = HashMap::with_capacity(labels.len());
        for label in &labels {
            if label.is_empty() {
                return Err(ConfidenceError::EmptyLabel);
            }
            if scores.insert(label.clone(), 0.0).is_some() {
                return Err(ConfidenceError::DuplicateLabel(label.clone()));
            }
        }
        self.labels = labels;
        self.scores = scores;
        Ok(())
    }

    /// Updates scores in place. The update is rejected as a whole if any entry
    /// is invalid, leaving the model untouched.
    pub fn merge(&mut self, updates: &HashMap<String, f32>) -> Result<(), ConfidenceError> {
        if self.labels.is_empty() {
            return Err(ConfidenceError::NoManifest);
        }
        for (label, &value) in updates {
            if !self.scores.contains_key(label) {
                return Err(ConfidenceError::UnknownClass(label.clone()));
            }
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfidenceError::OutOfRange {
                    label: label.clone(),
                    value,
                });
            }
        }
        for (label, &value) in updates {
            if let Some(score) = self.scores.get_mut(label) {
                *score = value;
            }
        }
        Ok(())
    }

    pub fn reset(&mut self) {
        self.labels.clear();
        self.scores.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn get(&self, label: &str) -> Option<f32> {
        self.scores.get(label).copied()
    }

    /// Scores in manifest order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, f32)> + '_ {
        self.labels
            .iter()
            .map(|label| (label.as_str(), self.scores.get(label).copied().unwrap_or(0.0)))
    }

    /// Highest scoring class. Ties go to the label listed first in the manifest.
    pub fn top(&self) -> Option<Prediction> {
        let mut best: Option<(&str, f32)> = None;
        for (label, confidence) in self.iter() {
            match best {
                Some((_, current)) if confidence <= current => {}
                _ => best = Some((label, confidence)),
            }
        }
        best.map(|(label, confidence)| Prediction {
            label: label.to_string(),
            confidence,
        })
    }

    pub fn report(&self) -> ConfidenceReport {
        ConfidenceReport {
            classes: self
                .iter()
                .map(|(label, confidence)| ClassConfidence {
                    label: label.to_string(),
                    confidence,
                    percent: to_percent(confidence),
                })
                .collect(),
            top: self.top(),
        }
    }
}

fn to_percent(confidence: f32) -> u32 {
    (confidence * 100.0).round().clamp(0.0, 100.0) as u32
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Prediction {
    pub label: String,
    pub confidence: f32,
}

impl Prediction {
    pub fn percent(&self) -> u32 {
        to_percent(self.confidence)
    }
}

impl fmt::Display for Prediction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}%)", self.label, self.percent())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassConfidence {
    pub label: String,
    pub confidence: f32,
    pub percent: u32,
}

/// Serializable view of a [`ConfidenceModel`], published after every update.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ConfidenceReport {
    pub classes: Vec<ClassConfidence>,
    pub top: Option<Prediction>,
}
