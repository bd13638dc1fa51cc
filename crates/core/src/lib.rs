//! Template-driven conversation encoding.
//!
//! This crate turns multi-turn, optionally multi-modal conversations into the
//! parallel `input_ids` / `labels` / `loss_scale` sequences a causal language
//! model trains on. A [`TemplateDefinition`] describes one model family's
//! conversation grammar; binding it to a [`Tokenizer`] yields a
//! [`BoundTemplate`] that encodes examples and collates batches.

use std::fmt;

use crate::error::Result;

/// Label value marking a token as excluded from the loss.
pub const IGNORE_INDEX: i64 = -100;

/// Default system text of the general-purpose templates.
pub const DEFAULT_SYSTEM: &str = "You are a helpful assistant.";

/// Named special tokens a template may refer to symbolically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SpecialToken {
    Bos,
    Eos,
    Pad,
}

impl SpecialToken {
    /// Parse `bos_token_id`, `eos_token_id` or `pad_token_id`.
    pub fn from_symbol(symbol: &str) -> Option<Self> {
        match symbol {
            "bos_token_id" => Some(SpecialToken::Bos),
            "eos_token_id" => Some(SpecialToken::Eos),
            "pad_token_id" => Some(SpecialToken::Pad),
            _ => None,
        }
    }
}

impl fmt::Display for SpecialToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SpecialToken::Bos => "bos_token_id",
            SpecialToken::Eos => "eos_token_id",
            SpecialToken::Pad => "pad_token_id",
        })
    }
}

/// Trait for tokenization operations.
///
/// Templates insert special tokens themselves, so `encode` is called with
/// `add_special_tokens = false` except when probing the tokenizer's own
/// behaviour.
pub trait Tokenizer {
    /// Encode text into token ids.
    fn encode(&self, text: &str, add_special_tokens: bool) -> Result<Vec<u32>>;

    /// Decode token ids back into text.
    fn decode(&self, ids: &[u32]) -> Result<String>;

    /// Look up the id of a single token string.
    fn token_to_id(&self, token: &str) -> Option<u32>;

    /// Id of a named special token, if the vocabulary defines one.
    fn special_token_id(&self, token: SpecialToken) -> Option<u32>;
}

// Blanket implementation for references to Tokenizers
impl<T: Tokenizer + ?Sized> Tokenizer for &T {
    fn encode(&self, text: &str, add_special_tokens: bool) -> Result<Vec<u32>> {
        (**self).encode(text, add_special_tokens)
    }

    fn decode(&self, ids: &[u32]) -> Result<String> {
        (**self).decode(ids)
    }

    fn token_to_id(&self, token: &str) -> Option<u32> {
        (**self).token_to_id(token)
    }

    fn special_token_id(&self, token: SpecialToken) -> Option<u32> {
        (**self).special_token_id(token)
    }
}

mod builtin;
pub mod collator;
pub mod config;
pub mod context;
pub mod encoder;
pub mod error;
pub mod example;
pub mod loss_scale;
pub mod media;
pub mod pipeline;
pub mod registry;
pub mod resolver;
pub mod stats;
pub mod template;
pub mod tools;
pub mod truncation;

#[cfg(test)]
pub(crate) mod testing;

pub use collator::{collate, Batch, CollatorConfig, PaddingSide, SequenceParallel};
pub use config::BindOptions;
pub use context::{Context, ContextUnit};
pub use encoder::{
    BoundTemplate, EncodedExample, GenerationPair, PreferenceOptions, PreferencePair, PromptTruncation,
    RenderedExample, TokenizerKwargs,
};
pub use error::{Result as EncodeResult, TemplateError};
pub use example::{ConversationExample, GroundingObject, HistoryTurn, Message, QueryRole, RawExample};
pub use loss_scale::{KeywordWeight, LossScale};
pub use media::{
    GroundingTask, MediaKind, MediaProcessor, MediaRef, MediaTagReplacer, PromptLanguage, SideChannel,
};
pub use pipeline::{
    discover_dataset_files, encode_dataset, load_all_examples, load_examples, write_jsonl_output,
    EncodedDataset, PipelineConfig, PipelineResult,
};
pub use registry::{get_template, register_template, template_ids, TemplateMeta, TemplateRegistry};
pub use resolver::{
    EncodeContext, InternVlStrategy, LlavaStrategy, ModelStrategy, PlainStrategy, QwenAudioStrategy,
    QwenVlStrategy, Replacement,
};
pub use stats::LengthStats;
pub use template::{Prompt, Segment, TemplateDefinition, TokenRef};
pub use tools::ToolPromptStyle;
pub use truncation::TruncationStrategy;
