//! Bound templates: a definition paired with a tokenizer and session options.
//!
//! Encoding runs in fixed stages: validate, build the context, simplify,
//! split markers, resolve markers, tokenize, truncate, then let the model
//! strategy post-process. Everything per example lives on the stack, so one
//! `BoundTemplate` can be shared by worker threads.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::collator::{collate, Batch, CollatorConfig};
use crate::config::BindOptions;
use crate::context::{Context, ContextBuilder, ContextUnit, ResolvedPrompts, Substitutions};
use crate::error::{Result, TemplateError};
use crate::example::ConversationExample;
use crate::loss_scale::LossScale;
use crate::media::{MediaKind, MediaProcessor, SideChannel};
use crate::registry::TemplateMeta;
use crate::resolver::EncodeContext;
use crate::template::{Prompt, Segment, TemplateDefinition, TokenRef, RESPONSE_PLACEHOLDER};
use crate::tools::{system_with_tools, ToolPromptStyle};
use crate::truncation::{truncate_left, TruncationStrategy};
use crate::{SpecialToken, Tokenizer, IGNORE_INDEX};

/// Parallel token sequences for one example.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct EncodedExample {
    pub input_ids: Vec<i64>,
    /// `IGNORE_INDEX` where the token is excluded from the loss. Absent for
    /// generation-only encodings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<Vec<i64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loss_scale: Option<Vec<f32>>,
    /// Processed media keyed by side-channel name.
    #[serde(skip)]
    pub side_channels: BTreeMap<String, Vec<SideChannel>>,
}

impl EncodedExample {
    pub fn len(&self) -> usize {
        self.input_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.input_ids.is_empty()
    }
}

/// Extra model inputs produced alongside the token ids.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TokenizerKwargs(BTreeMap<String, Value>);

impl TokenizerKwargs {
    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.0.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }
}

/// Prompt ids and the ids `generate` is expected to produce.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct GenerationPair {
    pub input_ids: Vec<i64>,
    pub labels: Vec<i64>,
}

/// Which end of the prompt survives preference truncation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptTruncation {
    KeepStart,
    #[default]
    KeepEnd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreferenceOptions {
    pub max_prompt_length: usize,
    pub truncation_mode: PromptTruncation,
}

impl Default for PreferenceOptions {
    fn default() -> Self {
        Self {
            max_prompt_length: 512,
            truncation_mode: PromptTruncation::KeepEnd,
        }
    }
}

/// A shared prompt with chosen and rejected continuations.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct PreferencePair {
    pub prompt_input_ids: Vec<i64>,
    pub chosen: EncodedExample,
    pub rejected: EncodedExample,
}

/// Human-readable view of an encoded example.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RenderedExample {
    pub input: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<String>,
}

fn resolve_token<T: Tokenizer>(token: &TokenRef, tokenizer: &T) -> Result<i64> {
    match token {
        TokenRef::Id(id) => Ok(i64::from(*id)),
        TokenRef::Symbol(symbol) => SpecialToken::from_symbol(symbol)
            .and_then(|special| tokenizer.special_token_id(special))
            .or_else(|| tokenizer.token_to_id(symbol))
            .map(i64::from)
            .ok_or_else(|| TemplateError::MissingSpecialToken(symbol.clone())),
    }
}

fn resolve_prompt<T: Tokenizer>(prompt: &Prompt, tokenizer: &T) -> Result<Vec<ContextUnit>> {
    prompt
        .iter()
        .map(|segment| match segment {
            Segment::Text(text) => Ok(ContextUnit::Text(text.clone())),
            Segment::Tokens(tokens) => tokens
                .iter()
                .map(|t| resolve_token(t, tokenizer))
                .collect::<Result<Vec<_>>>()
                .map(ContextUnit::Tokens),
        })
        .collect()
}

fn starts_with_id(units: &[ContextUnit], id: i64) -> bool {
    matches!(units.first(), Some(ContextUnit::Tokens(ids)) if ids.first() == Some(&id))
}

/// A template bound to a tokenizer. Obtained from [`crate::TemplateRegistry::bind`].
pub struct BoundTemplate<T: Tokenizer> {
    template_id: String,
    definition: TemplateDefinition,
    meta: TemplateMeta,
    tokenizer: T,
    prompts: ResolvedPrompts,
    default_system: Option<String>,
    max_length: Option<usize>,
    truncation_strategy: TruncationStrategy,
    loss_scale: LossScale,
    compute_per_round_loss: bool,
    tools_prompt: ToolPromptStyle,
    collator: CollatorConfig,
    media_processor: Option<Arc<dyn MediaProcessor>>,
}

impl<T: Tokenizer> std::fmt::Debug for BoundTemplate<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundTemplate")
            .field("template_id", &self.template_id)
            .field("max_length", &self.max_length)
            .field("truncation_strategy", &self.truncation_strategy)
            .field("default_system", &self.default_system)
            .finish_non_exhaustive()
    }
}

impl<T: Tokenizer> BoundTemplate<T> {
    /// Resolve symbolic tokens against `tokenizer` and apply `options`.
    pub(crate) fn new(
        template_id: &str,
        definition: TemplateDefinition,
        meta: TemplateMeta,
        tokenizer: T,
        options: BindOptions,
    ) -> Result<Self> {
        let default_system = match options.default_system {
            Some(system) => (!system.is_empty()).then_some(system),
            None => definition.default_system.clone(),
        };
        if default_system.is_some() && !definition.supports_system() {
            return Err(TemplateError::UnsupportedSystem(template_id.to_string()));
        }

        let mut prefix = resolve_prompt(&definition.prefix, &tokenizer)?;
        let mut system_prefix = definition
            .system_prefix
            .as_ref()
            .map(|p| resolve_prompt(p, &tokenizer))
            .transpose()?;
        if definition.auto_add_bos {
            let bos = tokenizer.special_token_id(SpecialToken::Bos).map(i64::from);
            let adds_bos = tokenizer.encode("", true)?;
            if let Some(bos) = bos.filter(|b| adds_bos.iter().any(|id| i64::from(*id) == *b)) {
                for units in std::iter::once(&mut prefix).chain(system_prefix.as_mut()) {
                    if !starts_with_id(units, bos) {
                        units.insert(0, ContextUnit::Tokens(vec![bos]));
                    }
                }
            }
        }
        let prompt = resolve_prompt(&definition.prompt, &tokenizer)?;
        let tool_prompt = match &definition.tool_prompt {
            Some(p) => resolve_prompt(p, &tokenizer)?,
            None => prompt.clone(),
        };
        let chat_sep = definition
            .chat_sep
            .as_ref()
            .map(|p| resolve_prompt(p, &tokenizer))
            .transpose()?;
        let suffix = resolve_prompt(&definition.suffix, &tokenizer)?;

        let loss_scale = options.loss_scale.unwrap_or_else(|| definition.loss_scale.clone());
        loss_scale.validate()?;

        let pad_token_id = tokenizer
            .special_token_id(SpecialToken::Pad)
            .or_else(|| tokenizer.special_token_id(SpecialToken::Eos))
            .map_or(0, i64::from);

        info!(
            template = template_id,
            strategy = definition.strategy.name(),
            max_length = ?options.max_length,
            truncation = %options.truncation_strategy,
            "bound template"
        );

        Ok(Self {
            template_id: template_id.to_string(),
            prompts: ResolvedPrompts {
                prefix,
                system_prefix,
                prompt,
                tool_prompt,
                chat_sep,
                suffix,
            },
            default_system,
            max_length: options.max_length,
            truncation_strategy: options.truncation_strategy,
            loss_scale,
            compute_per_round_loss: options.compute_per_round_loss,
            tools_prompt: options.tools_prompt.unwrap_or(definition.tools_prompt),
            collator: CollatorConfig {
                pad_token_id,
                padding_side: options.padding_side,
                sequence_parallel: options.sequence_parallel,
            },
            media_processor: options.media_processor,
            definition,
            meta,
            tokenizer,
        })
    }

    pub fn template_id(&self) -> &str {
        &self.template_id
    }

    pub fn definition(&self) -> &TemplateDefinition {
        &self.definition
    }

    pub fn meta(&self) -> &TemplateMeta {
        &self.meta
    }

    pub fn tokenizer(&self) -> &T {
        &self.tokenizer
    }

    pub fn default_system(&self) -> Option<&str> {
        self.default_system.as_deref()
    }

    pub fn max_length(&self) -> Option<usize> {
        self.max_length
    }

    pub fn stop_words(&self) -> &[String] {
        &self.definition.stop_words
    }

    fn validate(&self, example: &ConversationExample) -> Result<()> {
        if !example.history.is_empty() && !self.definition.supports_multi_round() {
            return Err(TemplateError::UnsupportedMultiRound(self.template_id.clone()));
        }
        self.definition
            .strategy
            .validate_example(&self.template_id, example)
    }

    /// `None` uses the bound default; an empty string means no system text.
    fn system_for(&self, example: &ConversationExample) -> Result<Option<String>> {
        let system = match &example.system {
            Some(system) if system.is_empty() => None,
            Some(system) => Some(system.clone()),
            None => self.default_system.clone(),
        };
        let system = system_with_tools(system, &example.tools, self.tools_prompt);
        if system.is_some() && !self.definition.supports_system() {
            return Err(TemplateError::UnsupportedSystem(self.template_id.clone()));
        }
        Ok(system)
    }

    fn builder(&self) -> ContextBuilder<'_> {
        ContextBuilder::new(&self.loss_scale, self.compute_per_round_loss)
    }

    fn encode_ids(&self, text: &str) -> Result<Vec<i64>> {
        Ok(self
            .tokenizer
            .encode(text, false)?
            .into_iter()
            .map(i64::from)
            .collect())
    }

    /// Split, resolve and tokenize a built context.
    fn tokenize(&self, context: Context, ctx: &mut EncodeContext<'_>) -> Result<EncodedExample> {
        let strategy = &self.definition.strategy;
        let context = context.split_markers(strategy.supported_markers());
        let context = strategy.pre_tokenize(context, ctx)?;

        let mut encoded = EncodedExample::default();
        let mut labels = Vec::new();
        let mut loss_scale = Vec::new();
        for (unit, weight) in context {
            let ids = match unit {
                ContextUnit::Text(text) => self.encode_ids(&text)?,
                ContextUnit::Tokens(ids) => ids,
                ContextUnit::Marker(marker) => self.encode_ids(marker.tag())?,
            };
            for id in ids {
                encoded.input_ids.push(id);
                labels.push(if weight > 0.0 && id >= 0 { id } else { IGNORE_INDEX });
                loss_scale.push(weight);
            }
        }
        encoded.labels = Some(labels);
        encoded.loss_scale = Some(loss_scale);
        Ok(encoded)
    }

    /// Response plus suffix only, for pair encodings.
    fn tokenize_tail(
        &self,
        system: Option<&str>,
        response: &str,
        ctx: &mut EncodeContext<'_>,
    ) -> Result<EncodedExample> {
        let builder = self.builder();
        let values = Substitutions {
            system,
            response: Some(response),
            compute_loss: true,
            ..Default::default()
        };
        let mut tail = Context::default();
        builder.concat(
            &mut tail,
            &[ContextUnit::Text(RESPONSE_PLACEHOLDER.to_string())],
            &values,
            0.0,
        )?;
        builder.concat(&mut tail, &self.prompts.suffix, &values, 1.0)?;
        self.tokenize(tail, ctx)
    }

    fn attach_media(&self, example: &ConversationExample, encoded: &mut EncodedExample) -> Result<()> {
        let Some(processor) = &self.media_processor else {
            return Ok(());
        };
        for kind in MediaKind::ALL {
            for media in example.media(kind) {
                let channel = processor.process(kind, media)?;
                encoded
                    .side_channels
                    .entry(kind.side_channel_key().to_string())
                    .or_default()
                    .push(channel);
            }
        }
        Ok(())
    }

    /// Encode one example.
    ///
    /// Returns `Ok(None)` when the `delete` strategy drops an overlong example.
    /// Labels and loss scale are only produced when the example has a response.
    pub fn encode(&self, example: &ConversationExample) -> Result<Option<(EncodedExample, TokenizerKwargs)>> {
        self.validate(example)?;
        let system = self.system_for(example)?;
        let response = example.response.as_deref();
        let context = self
            .builder()
            .build(&self.prompts, example, system.as_deref(), response)?
            .simplify();

        let mut ctx = EncodeContext::new(&self.template_id, example, &self.tokenizer);
        let mut encoded = self.tokenize(context, &mut ctx)?;
        if response.is_none() {
            encoded.labels = None;
            encoded.loss_scale = None;
        }

        let mut encoded = match self.max_length {
            Some(max_length) => match self.truncation_strategy.apply(encoded, max_length)? {
                Some(encoded) => encoded,
                None => return Ok(None),
            },
            None => encoded,
        };

        let mut kwargs = TokenizerKwargs::default();
        self.definition
            .strategy
            .post_encode(&mut encoded, &mut kwargs, &ctx)?;
        self.attach_media(example, &mut encoded)?;
        debug!(template = %self.template_id, length = encoded.len(), "encoded example");
        Ok(Some((encoded, kwargs)))
    }

    /// Prompt-only ids paired with the expected generation (response and
    /// suffix). The prompt is left-truncated to `max_length`.
    pub fn encode_generation_pair(&self, example: &ConversationExample) -> Result<GenerationPair> {
        let response = example.response.as_deref().ok_or_else(|| {
            TemplateError::InvalidExample("generation pair requires a response".to_string())
        })?;
        self.validate(example)?;
        let system = self.system_for(example)?;
        let context = self
            .builder()
            .build(&self.prompts, example, system.as_deref(), None)?
            .simplify();
        let mut ctx = EncodeContext::new(&self.template_id, example, &self.tokenizer);
        let mut prompt = self.tokenize(context, &mut ctx)?;
        if let Some(max_length) = self.max_length {
            truncate_left(&mut prompt, max_length);
        }
        let tail = self.tokenize_tail(system.as_deref(), response, &mut ctx)?;
        Ok(GenerationPair {
            input_ids: prompt.input_ids,
            labels: tail.input_ids,
        })
    }

    /// Encode a shared prompt with a chosen (the example's response) and a
    /// rejected continuation.
    ///
    /// When prompt plus the longer continuation exceeds `max_length`, the
    /// prompt is cut to `max_prompt_length` and, if still too long, both
    /// continuations are cut to the remaining budget.
    pub fn encode_preference(
        &self,
        example: &ConversationExample,
        rejected_response: &str,
        options: &PreferenceOptions,
    ) -> Result<PreferencePair> {
        let chosen_response = example.response.as_deref().ok_or_else(|| {
            TemplateError::InvalidExample("preference pair requires a chosen response".to_string())
        })?;
        self.validate(example)?;
        let system = self.system_for(example)?;
        let context = self
            .builder()
            .build(&self.prompts, example, system.as_deref(), None)?
            .simplify();
        let mut ctx = EncodeContext::new(&self.template_id, example, &self.tokenizer);
        let mut prompt = self.tokenize(context, &mut ctx)?.input_ids;
        let mut rejected_ctx = ctx.clone();
        let mut chosen = self.tokenize_tail(system.as_deref(), chosen_response, &mut ctx)?;
        let mut rejected = self.tokenize_tail(system.as_deref(), rejected_response, &mut rejected_ctx)?;

        if let Some(max_length) = self.max_length {
            let longer = chosen.len().max(rejected.len());
            if prompt.len() + longer > max_length && prompt.len() > options.max_prompt_length {
                let cut = prompt.len() - options.max_prompt_length;
                match options.truncation_mode {
                    PromptTruncation::KeepStart => prompt.truncate(options.max_prompt_length),
                    PromptTruncation::KeepEnd => {
                        prompt.drain(..cut);
                    }
                }
            }
            if prompt.len() + longer > max_length {
                let budget = max_length.saturating_sub(prompt.len());
                for tail in [&mut chosen, &mut rejected] {
                    tail.input_ids.truncate(budget);
                    if let Some(labels) = tail.labels.as_mut() {
                        labels.truncate(budget);
                    }
                    if let Some(loss_scale) = tail.loss_scale.as_mut() {
                        loss_scale.truncate(budget);
                    }
                }
            }
        }

        let join = |tail: EncodedExample| {
            let mut labels = vec![IGNORE_INDEX; prompt.len()];
            labels.extend(tail.labels.unwrap_or_default());
            let mut loss_scale = vec![0.0; prompt.len()];
            loss_scale.extend(tail.loss_scale.unwrap_or_default());
            let mut input_ids = prompt.clone();
            input_ids.extend(tail.input_ids);
            EncodedExample {
                input_ids,
                labels: Some(labels),
                loss_scale: Some(loss_scale),
                side_channels: BTreeMap::new(),
            }
        };
        let mut chosen = join(chosen);
        let mut rejected = join(rejected);
        self.attach_media(example, &mut chosen)?;
        self.attach_media(example, &mut rejected)?;
        Ok(PreferencePair {
            prompt_input_ids: prompt,
            chosen,
            rejected,
        })
    }

    /// Decode ids, showing each run of negative ids as `[id * count]`.
    pub fn safe_decode(&self, ids: &[i64]) -> Result<String> {
        let mut out = String::new();
        let mut start = 0;
        while start < ids.len() {
            let negative = ids[start] < 0;
            let mut end = start + 1;
            while end < ids.len()
                && (ids[end] < 0) == negative
                && (!negative || ids[end] == ids[start])
            {
                end += 1;
            }
            if negative {
                out.push_str(&format!("[{} * {}]", ids[start], end - start));
            } else {
                let run = ids[start..end]
                    .iter()
                    .map(|id| {
                        u32::try_from(*id).map_err(|_| {
                            TemplateError::Tokenizer(format!("token id {id} is out of range"))
                        })
                    })
                    .collect::<Result<Vec<u32>>>()?;
                out.push_str(&self.tokenizer.decode(&run)?);
            }
            start = end;
        }
        Ok(out)
    }

    /// Decode an encoded example for inspection.
    pub fn render_example(&self, encoded: &EncodedExample) -> Result<RenderedExample> {
        Ok(RenderedExample {
            input: self.safe_decode(&encoded.input_ids)?,
            labels: encoded
                .labels
                .as_deref()
                .map(|labels| self.safe_decode(labels))
                .transpose()?,
        })
    }

    /// Pad a batch with this template's padding configuration.
    pub fn data_collator(&self, batch: &[EncodedExample], padding_to: Option<usize>) -> Result<Batch> {
        collate(batch, padding_to, &self.collator)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::example::HistoryTurn;
    use crate::prompt;
    use crate::resolver::{LlavaStrategy, QwenVlStrategy, IMAGE_TOKEN_INDEX};
    use crate::testing::MockTokenizer;

    fn bind(definition: TemplateDefinition, options: BindOptions) -> BoundTemplate<MockTokenizer> {
        BoundTemplate::new("test", definition, TemplateMeta::default(), MockTokenizer::new(), options).unwrap()
    }

    fn simple() -> TemplateDefinition {
        TemplateDefinition::new(prompt![], prompt!["U:{{QUERY}} A:"], Some(prompt!["\n"]), prompt!["<eos>"])
    }

    fn bytes(text: &str) -> Vec<i64> {
        text.bytes().map(i64::from).collect()
    }

    fn assert_parallel(encoded: &EncodedExample) {
        let n = encoded.input_ids.len();
        assert_eq!(encoded.labels.as_ref().map(Vec::len), Some(n));
        assert_eq!(encoded.loss_scale.as_ref().map(Vec::len), Some(n));
    }

    /// Decode the labelled (weight > 0) spans and the masked spans separately.
    fn split_spans(template: &BoundTemplate<MockTokenizer>, encoded: &EncodedExample) -> (String, String) {
        let labels = encoded.labels.as_ref().unwrap();
        let (mut kept, mut masked) = (Vec::new(), Vec::new());
        for (id, label) in encoded.input_ids.iter().zip(labels) {
            if *label == IGNORE_INDEX {
                masked.push(*id);
            } else {
                kept.push(*id);
            }
        }
        (
            template.safe_decode(&kept).unwrap(),
            template.safe_decode(&masked).unwrap(),
        )
    }

    #[test]
    fn test_single_round_scenario() {
        let template = bind(simple(), BindOptions::default());
        let example = ConversationExample::new("hi").with_response("yo");
        let (encoded, kwargs) = template.encode(&example).unwrap().unwrap();

        let prompt = bytes("U:hi A:");
        let mut expected = prompt.clone();
        expected.extend(bytes("yo"));
        expected.push(1007);
        assert_eq!(encoded.input_ids, expected);

        let labels = encoded.labels.as_ref().unwrap();
        assert!(labels[..prompt.len()].iter().all(|l| *l == IGNORE_INDEX));
        assert_eq!(labels[prompt.len()..], expected[prompt.len()..]);
        assert_parallel(&encoded);
        assert!(kwargs.is_empty());
    }

    #[test]
    fn test_multi_round_rejected_without_separator() {
        let definition = TemplateDefinition::new(prompt![], prompt!["{{QUERY}}"], None, prompt!["<eos>"]);
        let template = bind(definition, BindOptions::default());
        let example = ConversationExample::new("q")
            .with_response("r")
            .with_history(vec![HistoryTurn::new("a", "b")]);
        let err = template.encode(&example).unwrap_err();
        assert!(matches!(err, TemplateError::UnsupportedMultiRound(_)));
    }

    #[test]
    fn test_system_rejected_without_system_prefix() {
        let template = bind(simple(), BindOptions::default());
        let example = ConversationExample::new("q").with_response("r").with_system("be nice");
        assert!(matches!(
            template.encode(&example).unwrap_err(),
            TemplateError::UnsupportedSystem(_)
        ));

        // An explicitly empty system is fine.
        let example = ConversationExample::new("q").with_response("r").with_system("");
        assert!(template.encode(&example).unwrap().is_some());

        let err = BoundTemplate::new(
            "test",
            simple(),
            TemplateMeta::default(),
            MockTokenizer::new(),
            BindOptions::default().with_default_system("sys"),
        )
        .unwrap_err();
        assert!(matches!(err, TemplateError::UnsupportedSystem(_)));
    }

    #[test]
    fn test_response_round_trip_with_history() {
        let definition = TemplateDefinition::new(
            prompt!["<<{{SYSTEM}}>>"],
            prompt!["[{{ROUND1}}] {{QUERY}} => "],
            Some(prompt!["\n"]),
            prompt![Segment::symbols(&["eos_token_id"])],
        )
        .with_default_system("sys");
        let template = bind(definition, BindOptions::default());
        let example = ConversationExample::new("second")
            .with_response("final answer")
            .with_history(vec![HistoryTurn::new("first", "old answer")]);
        let (encoded, _) = template.encode(&example).unwrap().unwrap();
        assert_parallel(&encoded);

        let (kept, masked) = split_spans(&template, &encoded);
        assert_eq!(kept, "final answer</s>");
        assert_eq!(masked, "<<sys>>[1] first => old answer\n[2] second => ");
        assert!(!masked.contains("final answer"));
    }

    #[test]
    fn test_per_round_loss_and_agent_weights() {
        let options = BindOptions {
            loss_scale: Some(LossScale::Agent),
            compute_per_round_loss: true,
            ..Default::default()
        };
        let template = bind(simple(), options);
        let example = ConversationExample::new("q2")
            .with_response("Thought: t\nObservation: secret\nFinal Answer: a")
            .with_history(vec![HistoryTurn::new("q1", "r1")]);
        let (encoded, _) = template.encode(&example).unwrap().unwrap();
        assert_parallel(&encoded);
        let (kept, _) = split_spans(&template, &encoded);
        assert!(kept.starts_with("r1"));
        assert!(kept.contains("Observation:"));
        assert!(!kept.contains("secret"));
        assert!(kept.ends_with("Final Answer: a<eos>"));
    }

    #[test]
    fn test_generation_only_has_no_labels() {
        let template = bind(simple(), BindOptions::default());
        let (encoded, _) = template.encode(&ConversationExample::new("hi")).unwrap().unwrap();
        assert_eq!(encoded.input_ids, bytes("U:hi A:"));
        assert!(encoded.labels.is_none());
        assert!(encoded.loss_scale.is_none());
    }

    fn qwen_vl_like() -> TemplateDefinition {
        simple().with_strategy(Arc::new(QwenVlStrategy))
    }

    #[test]
    fn test_media_count_must_match_markers() {
        let template = bind(qwen_vl_like(), BindOptions::default());
        let mut example = ConversationExample::new("<image>what is <image>?").with_response("cats");
        example.images = vec!["a.png".into(), "b.png".into()];
        let (encoded, _) = template.encode(&example).unwrap().unwrap();
        let (_, masked) = split_spans(&template, &encoded);
        assert!(masked.contains("Picture 1: <img>a.png</img>\n"));
        assert!(masked.contains("Picture 2: <img>b.png</img>\n"));

        example.images.push("c.png".into());
        let err = template.encode(&example).unwrap_err();
        assert!(matches!(err, TemplateError::MediaCountMismatch { markers: 2, items: 3, .. }));
    }

    #[test]
    fn test_truncation_left_keeps_tail() {
        let example = ConversationExample::new("a long enough query").with_response("and a response");
        let (full, _) = bind(simple(), BindOptions::default()).encode(&example).unwrap().unwrap();

        for max_length in [4, 10, full.len(), full.len() + 5] {
            let template = bind(
                simple(),
                BindOptions::default()
                    .with_max_length(max_length)
                    .with_truncation("truncation_left"),
            );
            let (cut, _) = template.encode(&example).unwrap().unwrap();
            assert_parallel(&cut);
            let kept = max_length.min(full.len());
            assert_eq!(cut.len(), kept);
            assert_eq!(cut.input_ids[..], full.input_ids[full.len() - kept..]);
        }
    }

    #[test]
    fn test_delete_yields_empty_result() {
        let template = bind(simple(), BindOptions::default().with_max_length(5));
        let example = ConversationExample::new("hello").with_response("world");
        assert!(template.encode(&example).unwrap().is_none());

        let strict = bind(simple(), BindOptions::default().with_max_length(5).with_truncation("bogus"));
        assert!(matches!(
            strict.encode(&example).unwrap_err(),
            TemplateError::SequenceTooLong { .. }
        ));
    }

    #[test]
    fn test_auto_add_bos_and_symbol_resolution() {
        let definition = TemplateDefinition::new(
            prompt![],
            prompt!["{{QUERY}}"],
            None,
            prompt![Segment::symbols(&["eos_token_id", "<|im_end|>"])],
        )
        .with_auto_add_bos(true);
        let template = bind(definition, BindOptions::default());
        let (encoded, _) = template
            .encode(&ConversationExample::new("x").with_response("y"))
            .unwrap()
            .unwrap();
        assert_eq!(encoded.input_ids, vec![1000, 120, 121, 1001, 1004]);

        let missing = TemplateDefinition::new(prompt![], prompt!["{{QUERY}}"], None, prompt![Segment::symbols(&["<nope>"])]);
        let err = BoundTemplate::new("t", missing, TemplateMeta::default(), MockTokenizer::new(), BindOptions::default())
            .unwrap_err();
        assert!(matches!(err, TemplateError::MissingSpecialToken(s) if s == "<nope>"));
    }

    #[test]
    fn test_tools_are_appended_to_system() {
        let definition = TemplateDefinition::new(
            prompt!["{{SYSTEM}}\n"],
            prompt!["{{QUERY}}"],
            None,
            prompt!["<eos>"],
        );
        let template = bind(
            definition,
            BindOptions {
                tools_prompt: Some(ToolPromptStyle::Json),
                ..Default::default()
            },
        );
        let mut example = ConversationExample::new("q").with_response("r");
        example.tools = vec![serde_json::json!({"name": "lookup"})];
        let (encoded, _) = template.encode(&example).unwrap().unwrap();
        let rendered = template.render_example(&encoded).unwrap();
        assert!(rendered.input.starts_with("You have access to the following tools:\n[{\"name\":\"lookup\"}]\n"));
    }

    #[test]
    fn test_generation_pair() {
        let template = bind(simple(), BindOptions::default().with_max_length(4));
        let example = ConversationExample::new("hello").with_response("ok");
        let pair = template.encode_generation_pair(&example).unwrap();
        assert_eq!(pair.input_ids, bytes("o A:"));
        let mut labels = bytes("ok");
        labels.push(1007);
        assert_eq!(pair.labels, labels);
    }

    #[test]
    fn test_preference_pair_keep_end() {
        let template = bind(simple(), BindOptions::default().with_max_length(12));
        let example = ConversationExample::new("abcdefgh").with_response("good");
        let options = PreferenceOptions {
            max_prompt_length: 5,
            truncation_mode: PromptTruncation::KeepEnd,
        };
        let pair = template.encode_preference(&example, "bad!!!!!", &options).unwrap();
        assert_eq!(pair.prompt_input_ids, bytes("gh A:"));
        assert_eq!(pair.chosen.len(), 5 + 5);
        assert_eq!(pair.rejected.len(), 12);
        assert_parallel(&pair.chosen);
        assert_parallel(&pair.rejected);
        let labels = pair.chosen.labels.as_ref().unwrap();
        assert!(labels[..5].iter().all(|l| *l == IGNORE_INDEX));
        assert_eq!(labels[5..], pair.chosen.input_ids[5..]);
    }

    #[test]
    fn test_preference_pair_carries_media_on_both_sides() {
        let template = bind(
            qwen_vl_like(),
            BindOptions::default().with_media_processor(Arc::new(FixedProcessor)),
        );
        let mut example = ConversationExample::new("<image>what?").with_response("a cat");
        example.images = vec!["cat.png".into()];
        let pair = template
            .encode_preference(&example, "a dog", &PreferenceOptions::default())
            .unwrap();
        assert_eq!(pair.chosen.side_channels["pixel_values"].len(), 1);
        assert_eq!(pair.rejected.side_channels, pair.chosen.side_channels);

        let batch = template.data_collator(&[pair.rejected], None).unwrap();
        assert_eq!(batch.media_counts["pixel_values"], vec![1]);
        assert_eq!(batch.side_channels["pixel_values"].data, vec![7.0]);
    }

    #[test]
    fn test_response_markers_beyond_media_are_rejected() {
        let example = {
            let mut example = ConversationExample::new("<image>what").with_response("see <image>");
            example.images = vec!["cat.png".into()];
            example
        };
        for definition in [qwen_vl_like(), simple().with_strategy(Arc::new(LlavaStrategy))] {
            let template = bind(definition, BindOptions::default());
            let err = template.encode(&example).unwrap_err();
            assert!(matches!(err, TemplateError::MediaCountMismatch { markers: 2, items: 1, .. }));
        }
    }

    #[test]
    fn test_render_masks_runs() {
        let template = bind(simple(), BindOptions::default());
        let example = ConversationExample::new("hi").with_response("yo");
        let (encoded, _) = template.encode(&example).unwrap().unwrap();
        let rendered = template.render_example(&encoded).unwrap();
        assert_eq!(rendered.input, "U:hi A:yo<eos>");
        assert_eq!(rendered.labels.as_deref(), Some("[-100 * 7]yo<eos>"));
    }

    #[test]
    fn test_llava_sentinel_positions() {
        let definition = simple().with_strategy(Arc::new(LlavaStrategy));
        let template = bind(definition, BindOptions::default());
        let mut example = ConversationExample::new("<image>\nwhat?").with_response("a cat");
        example.images = vec!["cat.png".into()];
        let (encoded, kwargs) = template.encode(&example).unwrap().unwrap();
        assert_eq!(encoded.input_ids[2], IMAGE_TOKEN_INDEX);
        assert_eq!(encoded.labels.as_ref().unwrap()[2], IGNORE_INDEX);
        assert_eq!(kwargs.get("image_positions"), Some(&serde_json::json!([2])));
    }

    #[derive(Debug)]
    struct FixedProcessor;

    impl MediaProcessor for FixedProcessor {
        fn process(&self, _kind: MediaKind, media: &crate::media::MediaRef) -> Result<SideChannel> {
            Ok(SideChannel::new(vec![1, 1], vec![media.as_str().len() as f32]))
        }
    }

    #[test]
    fn test_media_processor_side_channels_reach_batch() {
        let template = bind(
            qwen_vl_like(),
            BindOptions::default().with_media_processor(Arc::new(FixedProcessor)),
        );
        let mut one = ConversationExample::new("<image>").with_response("x");
        one.images = vec!["ab".into()];
        let mut two = ConversationExample::new("<image><image>").with_response("y");
        two.images = vec!["abc".into(), "abcd".into()];
        let encoded: Vec<EncodedExample> = [one, two]
            .iter()
            .map(|e| template.encode(e).unwrap().unwrap().0)
            .collect();
        assert_eq!(encoded[1].side_channels["pixel_values"].len(), 2);

        let batch = template.data_collator(&encoded, None).unwrap();
        assert_eq!(batch.media_counts["pixel_values"], vec![1, 2]);
        assert_eq!(batch.side_channels["pixel_values"].data, vec![2.0, 3.0, 4.0]);
        assert_eq!(batch.input_ids[0].len(), batch.input_ids[1].len());
    }
}
