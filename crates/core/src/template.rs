//! Declarative template definitions.
//!
//! A template describes one model's conversation grammar as ordered lists of
//! [`Segment`]s. Text segments may contain the placeholders below; token
//! segments hold literal ids or symbolic names resolved against the tokenizer
//! when the template is bound.

use std::sync::Arc;

use crate::loss_scale::LossScale;
use crate::resolver::{ModelStrategy, PlainStrategy};
use crate::tools::ToolPromptStyle;

pub const SYSTEM_PLACEHOLDER: &str = "{{SYSTEM}}";
pub const QUERY_PLACEHOLDER: &str = "{{QUERY}}";
/// Zero-based round index.
pub const ROUND0_PLACEHOLDER: &str = "{{ROUND0}}";
/// One-based round index.
pub const ROUND1_PLACEHOLDER: &str = "{{ROUND1}}";
/// Stands for the response; expanded by the loss-scale calculator.
pub const RESPONSE_PLACEHOLDER: &str = "{{RESPONSE}}";

/// A token literal inside a template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenRef {
    Id(u32),
    /// `bos_token_id`, `eos_token_id`, `pad_token_id`, or a special token string.
    Symbol(String),
}

impl From<u32> for TokenRef {
    fn from(id: u32) -> Self {
        TokenRef::Id(id)
    }
}

impl From<&str> for TokenRef {
    fn from(symbol: &str) -> Self {
        TokenRef::Symbol(symbol.to_string())
    }
}

/// One element of a prompt list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Text(String),
    Tokens(Vec<TokenRef>),
}

impl Segment {
    pub fn text(s: impl Into<String>) -> Self {
        Segment::Text(s.into())
    }

    pub fn ids(ids: &[u32]) -> Self {
        Segment::Tokens(ids.iter().copied().map(TokenRef::Id).collect())
    }

    pub fn symbols(symbols: &[&str]) -> Self {
        Segment::Tokens(symbols.iter().map(|s| TokenRef::from(*s)).collect())
    }

    fn contains(&self, placeholder: &str) -> bool {
        matches!(self, Segment::Text(s) if s.contains(placeholder))
    }
}

impl From<&str> for Segment {
    fn from(s: &str) -> Self {
        Segment::Text(s.to_string())
    }
}

/// Ordered prompt segments.
pub type Prompt = Vec<Segment>;

/// Build a [`Prompt`] from a mix of `&str`, [`Segment`] and token lists.
#[macro_export]
macro_rules! prompt {
    () => { Vec::<$crate::template::Segment>::new() };
    ($($seg:expr),+ $(,)?) => { vec![$($crate::template::Segment::from($seg)),+] };
}

/// One model's conversation grammar plus its attached capabilities.
///
/// Immutable once registered; binding works on a clone.
#[derive(Debug, Clone)]
pub struct TemplateDefinition {
    /// Used when no system text is present.
    pub prefix: Prompt,
    /// Used when system text is present. `None` means system text is rejected.
    pub system_prefix: Option<Prompt>,
    pub prompt: Prompt,
    /// Used for turns whose query role is `tool`; falls back to `prompt`.
    pub tool_prompt: Option<Prompt>,
    /// `None` means multi-round conversations are rejected.
    pub chat_sep: Option<Prompt>,
    pub suffix: Prompt,
    pub default_system: Option<String>,
    pub auto_add_bos: bool,
    pub stop_words: Vec<String>,
    pub strategy: Arc<dyn ModelStrategy>,
    pub loss_scale: LossScale,
    pub tools_prompt: ToolPromptStyle,
}

impl TemplateDefinition {
    /// Create a definition. A prefix that mentions `{{SYSTEM}}` becomes the
    /// system prefix; the system-less prefix keeps every other segment.
    pub fn new(prefix: Prompt, prompt: Prompt, chat_sep: Option<Prompt>, suffix: Prompt) -> Self {
        let (prefix, system_prefix) = if prefix.iter().any(|s| s.contains(SYSTEM_PLACEHOLDER)) {
            let plain = prefix
                .iter()
                .filter(|s| !s.contains(SYSTEM_PLACEHOLDER))
                .cloned()
                .collect();
            (plain, Some(prefix))
        } else {
            (prefix, None)
        };
        Self {
            prefix,
            system_prefix,
            prompt,
            tool_prompt: None,
            chat_sep,
            suffix,
            default_system: None,
            auto_add_bos: false,
            stop_words: Vec::new(),
            strategy: Arc::new(PlainStrategy),
            loss_scale: LossScale::Default,
            tools_prompt: ToolPromptStyle::ReactEn,
        }
    }

    pub fn with_system_prefix(mut self, system_prefix: Prompt) -> Self {
        self.system_prefix = Some(system_prefix);
        self
    }

    pub fn with_tool_prompt(mut self, tool_prompt: Prompt) -> Self {
        self.tool_prompt = Some(tool_prompt);
        self
    }

    /// Blank defaults are treated as no default.
    pub fn with_default_system(mut self, system: impl Into<String>) -> Self {
        let system = system.into();
        self.default_system = (!system.trim().is_empty()).then_some(system);
        self
    }

    pub fn with_auto_add_bos(mut self, auto_add_bos: bool) -> Self {
        self.auto_add_bos = auto_add_bos;
        self
    }

    pub fn with_stop_words(mut self, stop_words: &[&str]) -> Self {
        self.stop_words = stop_words.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_strategy(mut self, strategy: Arc<dyn ModelStrategy>) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_loss_scale(mut self, loss_scale: LossScale) -> Self {
        self.loss_scale = loss_scale;
        self
    }

    pub fn with_tools_prompt(mut self, style: ToolPromptStyle) -> Self {
        self.tools_prompt = style;
        self
    }

    pub fn supports_system(&self) -> bool {
        self.system_prefix.is_some()
    }

    pub fn supports_multi_round(&self) -> bool {
        self.chat_sep.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_prefix_split() {
        let def = TemplateDefinition::new(
            prompt!["{{SYSTEM}}\n\n"],
            prompt!["{{QUERY}}"],
            None,
            prompt![Segment::symbols(&["eos_token_id"])],
        );
        assert!(def.prefix.is_empty());
        assert!(def.supports_system());
        assert!(!def.supports_multi_round());
    }

    #[test]
    fn test_system_less_prefix_keeps_tokens() {
        let def = TemplateDefinition::new(
            prompt![Segment::symbols(&["bos_token_id"]), "<|sys|>{{SYSTEM}}\n", "---"],
            prompt!["{{QUERY}}"],
            None,
            prompt![],
        );
        assert_eq!(
            def.prefix,
            vec![Segment::symbols(&["bos_token_id"]), Segment::text("---")]
        );
        assert_eq!(def.system_prefix.as_ref().map(Vec::len), Some(3));
    }

    #[test]
    fn test_plain_prefix_stays() {
        let def = TemplateDefinition::new(
            prompt![Segment::ids(&[1, 2])],
            prompt!["{{QUERY}}"],
            Some(prompt!["\n"]),
            prompt![],
        );
        assert_eq!(def.prefix, vec![Segment::Tokens(vec![TokenRef::Id(1), TokenRef::Id(2)])]);
        assert!(!def.supports_system());
        assert!(def.supports_multi_round());
    }

    #[test]
    fn test_blank_default_system_is_none() {
        let def = TemplateDefinition::new(prompt![], prompt!["{{QUERY}}"], None, prompt![])
            .with_default_system("   ");
        assert_eq!(def.default_system, None);
    }
}
