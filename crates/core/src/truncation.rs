//! Length policies applied after encoding.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::encoder::EncodedExample;
use crate::error::{Result, TemplateError};

/// What happens to an example longer than `max_length`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum TruncationStrategy {
    /// Drop the example.
    #[default]
    Delete,
    /// Keep the last `max_length` tokens.
    TruncationLeft,
    /// Anything else. Overlong examples fail with `SequenceTooLong`.
    Unrecognized(String),
}

impl From<&str> for TruncationStrategy {
    fn from(name: &str) -> Self {
        match name {
            "delete" => TruncationStrategy::Delete,
            "truncation_left" => TruncationStrategy::TruncationLeft,
            other => TruncationStrategy::Unrecognized(other.to_string()),
        }
    }
}

impl From<String> for TruncationStrategy {
    fn from(name: String) -> Self {
        TruncationStrategy::from(name.as_str())
    }
}

impl From<TruncationStrategy> for String {
    fn from(strategy: TruncationStrategy) -> Self {
        strategy.to_string()
    }
}

impl fmt::Display for TruncationStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TruncationStrategy::Delete => f.write_str("delete"),
            TruncationStrategy::TruncationLeft => f.write_str("truncation_left"),
            TruncationStrategy::Unrecognized(name) => f.write_str(name),
        }
    }
}

/// Keep the last `max_length` positions of every parallel sequence.
pub fn truncate_left(encoded: &mut EncodedExample, max_length: usize) {
    let cut = encoded.input_ids.len().saturating_sub(max_length);
    if cut == 0 {
        return;
    }
    encoded.input_ids.drain(..cut);
    if let Some(labels) = encoded.labels.as_mut() {
        labels.drain(..cut);
    }
    if let Some(loss_scale) = encoded.loss_scale.as_mut() {
        loss_scale.drain(..cut);
    }
}

impl TruncationStrategy {
    /// Enforce `max_length`. `Ok(None)` means the example was deleted.
    pub fn apply(&self, mut encoded: EncodedExample, max_length: usize) -> Result<Option<EncodedExample>> {
        let length = encoded.len();
        if length <= max_length {
            return Ok(Some(encoded));
        }
        match self {
            TruncationStrategy::Delete => {
                debug!(length, max_length, "dropping overlong example");
                Ok(None)
            }
            TruncationStrategy::TruncationLeft => {
                truncate_left(&mut encoded, max_length);
                Ok(Some(encoded))
            }
            TruncationStrategy::Unrecognized(name) => Err(TemplateError::SequenceTooLong {
                length,
                max_length,
                strategy: name.clone(),
            }),
        }
    }
}
