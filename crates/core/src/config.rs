//! Per-session binding options.

use std::sync::Arc;

use serde::Deserialize;

use crate::collator::{PaddingSide, SequenceParallel};
use crate::loss_scale::LossScale;
use crate::media::MediaProcessor;
use crate::tools::ToolPromptStyle;
use crate::truncation::TruncationStrategy;

/// Options applied when a template is bound to a tokenizer.
///
/// Fields left as `None` fall back to the template definition.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BindOptions {
    /// Overrides the template's default system text. An empty string means
    /// no system text.
    pub default_system: Option<String>,
    pub max_length: Option<usize>,
    pub truncation_strategy: TruncationStrategy,
    pub loss_scale: Option<LossScale>,
    /// Weight historical responses with the loss-scale calculator as well.
    pub compute_per_round_loss: bool,
    pub tools_prompt: Option<ToolPromptStyle>,
    pub padding_side: PaddingSide,
    pub sequence_parallel: Option<SequenceParallel>,
    #[serde(skip)]
    pub media_processor: Option<Arc<dyn MediaProcessor>>,
}

impl BindOptions {
    pub fn with_max_length(mut self, max_length: usize) -> Self {
        self.max_length = Some(max_length);
        self
    }

    pub fn with_truncation(mut self, strategy: impl Into<TruncationStrategy>) -> Self {
        self.truncation_strategy = strategy.into();
        self
    }

    pub fn with_default_system(mut self, system: impl Into<String>) -> Self {
        self.default_system = Some(system.into());
        self
    }

    pub fn with_media_processor(mut self, processor: Arc<dyn MediaProcessor>) -> Self {
        self.media_processor = Some(processor);
        self
    }
}
