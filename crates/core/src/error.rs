//! Error types for template registration, binding and encoding.

use thiserror::Error;

/// Result type alias for encoder operations.
pub type Result<T> = std::result::Result<T, TemplateError>;

/// Errors raised while registering, binding or applying a template.
#[derive(Error, Debug)]
pub enum TemplateError {
    /// No template is registered under the requested id.
    #[error("Unknown template: `{0}`")]
    UnknownTemplate(String),

    /// A template with this id exists and `exist_ok` was not set.
    #[error("Template `{0}` is already registered")]
    DuplicateTemplate(String),

    /// System text was supplied to a template without a system-capable prefix.
    #[error("Template `{0}` does not support a system prompt")]
    UnsupportedSystem(String),

    /// History was supplied to a template without a chat separator.
    #[error("Template `{0}` does not support multi-round chat")]
    UnsupportedMultiRound(String),

    /// Marker occurrences do not match the number of supplied items.
    #[error("Found {markers} `{kind}` markers but {items} {kind} item(s) were supplied")]
    MediaCountMismatch {
        /// Media or object kind.
        kind: String,
        /// Markers found in the conversation.
        markers: usize,
        /// Items supplied with the example.
        items: usize,
    },

    /// The model family accepts at most one image per example.
    #[error("Template `{template}` accepts a single image per example, got {count}")]
    SingleImageOnly {
        /// Template id.
        template: String,
        /// Images supplied.
        count: usize,
    },

    /// Media of a kind the model family cannot place.
    #[error("Template `{template}` cannot place {kind} inputs")]
    UnsupportedMedia {
        /// Template id.
        template: String,
        /// Media kind.
        kind: String,
    },

    /// The sequence is too long and the truncation strategy is unrecognized.
    #[error("Sequence length {length} exceeds max_length {max_length} (truncation strategy `{strategy}`)")]
    SequenceTooLong {
        /// Encoded length.
        length: usize,
        /// Configured bound.
        max_length: usize,
        /// The unrecognized strategy name.
        strategy: String,
    },

    /// A symbolic token literal has no id in the tokenizer vocabulary.
    #[error("Tokenizer has no id for special token `{0}`")]
    MissingSpecialToken(String),

    /// Malformed raw example.
    #[error("Invalid example: {0}")]
    InvalidExample(String),

    /// Loss weights outside `[0, 1]`.
    #[error("Invalid loss scale: {0}")]
    InvalidLossScale(String),

    /// Bad collation request.
    #[error("Invalid padding: {0}")]
    InvalidPadding(String),

    /// The tokenizer collaborator failed.
    #[error("Tokenizer error: {0}")]
    Tokenizer(String),

    /// I/O errors.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON errors.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// CSV errors.
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}
