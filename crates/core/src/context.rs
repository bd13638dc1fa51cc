//! Context assembly: expanding template prompts against one example into an
//! ordered list of weighted context units.

use std::sync::LazyLock;

use regex::{Captures, Regex};

use crate::error::Result;
use crate::example::{ConversationExample, QueryRole};
use crate::loss_scale::LossScale;
use crate::media::{split_markers, Marker};
use crate::template::RESPONSE_PLACEHOLDER;

static PLACEHOLDER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{(SYSTEM|QUERY|ROUND0|ROUND1)\}\}").unwrap());

/// An atomic piece of the assembled prompt.
#[derive(Debug, Clone, PartialEq)]
pub enum ContextUnit {
    /// Text to run through the tokenizer.
    Text(String),
    /// Literal ids passed through untouched. May hold negative sentinels.
    Tokens(Vec<i64>),
    /// A reserved marker awaiting resolution.
    Marker(Marker),
}

/// Context units with parallel loss weights.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Context {
    units: Vec<ContextUnit>,
    weights: Vec<f32>,
}

impl Context {
    /// Append a unit. Empty text is dropped.
    pub fn push(&mut self, unit: ContextUnit, weight: f32) {
        if matches!(&unit, ContextUnit::Text(s) if s.is_empty()) {
            return;
        }
        self.units.push(unit);
        self.weights.push(weight);
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn units(&self) -> &[ContextUnit] {
        &self.units
    }

    pub fn weights(&self) -> &[f32] {
        &self.weights
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ContextUnit, f32)> {
        self.units.iter().zip(self.weights.iter().copied())
    }

    /// Merge runs of zero-weight text into single strings.
    pub fn simplify(self) -> Self {
        let mut out = Context::default();
        let mut pending = String::new();
        for (unit, weight) in self {
            match unit {
                ContextUnit::Text(text) if weight == 0.0 => pending.push_str(&text),
                unit => {
                    out.push(ContextUnit::Text(std::mem::take(&mut pending)), 0.0);
                    out.push(unit, weight);
                }
            }
        }
        out.push(ContextUnit::Text(pending), 0.0);
        out
    }

    /// Split supported markers out of text units; pieces keep the unit's weight.
    pub fn split_markers(self, supported: &[Marker]) -> Self {
        if supported.is_empty() {
            return self;
        }
        let mut out = Context::default();
        for (unit, weight) in self {
            match unit {
                ContextUnit::Text(text) => {
                    for (piece, marker) in split_markers(&text, supported) {
                        match marker {
                            Some(marker) => out.push(ContextUnit::Marker(marker), weight),
                            None => out.push(ContextUnit::Text(piece.to_string()), weight),
                        }
                    }
                }
                unit => out.push(unit, weight),
            }
        }
        out
    }
}

impl IntoIterator for Context {
    type Item = (ContextUnit, f32);
    type IntoIter = std::iter::Zip<std::vec::IntoIter<ContextUnit>, std::vec::IntoIter<f32>>;

    fn into_iter(self) -> Self::IntoIter {
        self.units.into_iter().zip(self.weights)
    }
}

/// Values substituted into one pass over a prompt list.
#[derive(Debug, Clone, Copy, Default)]
pub struct Substitutions<'a> {
    pub system: Option<&'a str>,
    pub query: Option<&'a str>,
    /// Zero-based round index.
    pub round: Option<usize>,
    pub response: Option<&'a str>,
    /// Whether the response contributes to the loss.
    pub compute_loss: bool,
}

/// Replace placeholders in one pass; substituted values are never rescanned.
/// Placeholders without a value are left in place.
pub fn substitute(text: &str, values: &Substitutions<'_>) -> String {
    if !text.contains("{{") {
        return text.to_string();
    }
    PLACEHOLDER_RE
        .replace_all(text, |caps: &Captures<'_>| {
            let value = match &caps[1] {
                "SYSTEM" => values.system.map(str::to_string),
                "QUERY" => values.query.map(str::to_string),
                "ROUND0" => values.round.map(|r| r.to_string()),
                "ROUND1" => values.round.map(|r| (r + 1).to_string()),
                _ => None,
            };
            value.unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

/// A template's prompt lists with symbolic tokens already resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedPrompts {
    pub prefix: Vec<ContextUnit>,
    pub system_prefix: Option<Vec<ContextUnit>>,
    pub prompt: Vec<ContextUnit>,
    pub tool_prompt: Vec<ContextUnit>,
    pub chat_sep: Option<Vec<ContextUnit>>,
    pub suffix: Vec<ContextUnit>,
}

/// Expands resolved prompts against an example.
#[derive(Debug, Clone, Copy)]
pub struct ContextBuilder<'a> {
    pub loss_scale: &'a LossScale,
    /// Let historical responses use the loss-scale calculator too.
    pub compute_per_round_loss: bool,
}

impl<'a> ContextBuilder<'a> {
    pub fn new(loss_scale: &'a LossScale, compute_per_round_loss: bool) -> Self {
        Self {
            loss_scale,
            compute_per_round_loss,
        }
    }

    /// Append `segments` with placeholders substituted. Non-response units get
    /// `weight`; a `{{RESPONSE}}` unit expands through the loss-scale calculator.
    pub fn concat(
        &self,
        context: &mut Context,
        segments: &[ContextUnit],
        values: &Substitutions<'_>,
        weight: f32,
    ) -> Result<()> {
        for segment in segments {
            match segment {
                ContextUnit::Text(text) if text == RESPONSE_PLACEHOLDER => {
                    let Some(response) = values.response else {
                        continue;
                    };
                    if values.compute_loss {
                        for (piece, piece_weight) in self.loss_scale.calculate(response)? {
                            context.push(ContextUnit::Text(piece), piece_weight);
                        }
                    } else {
                        context.push(ContextUnit::Text(response.to_string()), 0.0);
                    }
                }
                ContextUnit::Text(text) => {
                    context.push(ContextUnit::Text(substitute(text, values)), weight)
                }
                unit => context.push(unit.clone(), weight),
            }
        }
        Ok(())
    }

    /// Assemble the full context for `example`.
    ///
    /// The prefix is chosen by whether `system` is present. Historical rounds
    /// get prompt + response + separator (the separator is skipped when the
    /// next query is empty); the final round gets prompt + response + suffix,
    /// or the prompt alone when `response` is `None`.
    pub fn build(
        &self,
        prompts: &ResolvedPrompts,
        example: &ConversationExample,
        system: Option<&str>,
        response: Option<&str>,
    ) -> Result<Context> {
        let mut context = Context::default();
        let prefix = match (system, &prompts.system_prefix) {
            (Some(_), Some(system_prefix)) => system_prefix,
            _ => &prompts.prefix,
        };
        let base = Substitutions {
            system,
            ..Default::default()
        };
        self.concat(&mut context, prefix, &base, 0.0)?;

        let rounds: Vec<(&str, QueryRole, Option<&str>)> = example
            .history
            .iter()
            .map(|turn| (turn.query.as_str(), turn.query_role, Some(turn.response.as_str())))
            .chain(std::iter::once((example.query.as_str(), example.query_role, response)))
            .collect();
        let response_unit = [ContextUnit::Text(RESPONSE_PLACEHOLDER.to_string())];

        for (i, &(query, role, round_response)) in rounds.iter().enumerate() {
            let is_last = i + 1 == rounds.len();
            if !is_last && query.is_empty() && round_response.map_or(true, str::is_empty) {
                continue;
            }
            let values = Substitutions {
                system,
                query: Some(query),
                round: Some(i),
                response: round_response,
                compute_loss: is_last || self.compute_per_round_loss,
            };
            let prompt = match role {
                QueryRole::Tool => &prompts.tool_prompt,
                QueryRole::User => &prompts.prompt,
            };
            self.concat(&mut context, prompt, &values, 0.0)?;

            if !is_last {
                self.concat(&mut context, &response_unit, &values, 0.0)?;
                let next_query = rounds[i + 1].0;
                if let (false, Some(chat_sep)) = (next_query.is_empty(), &prompts.chat_sep) {
                    self.concat(&mut context, chat_sep, &values, 0.0)?;
                }
            } else if round_response.is_some() {
                self.concat(&mut context, &response_unit, &values, 0.0)?;
                self.concat(&mut context, &prompts.suffix, &values, 1.0)?;
            }
        }
        Ok(context)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::example::HistoryTurn;
    use crate::media::MediaKind;

    fn text(s: &str) -> ContextUnit {
        ContextUnit::Text(s.to_string())
    }

    fn prompts() -> ResolvedPrompts {
        ResolvedPrompts {
            prefix: vec![],
            system_prefix: Some(vec![text("S:{{SYSTEM}}|")]),
            prompt: vec![text("U{{ROUND1}}:{{QUERY}} A:")],
            tool_prompt: vec![text("T:{{QUERY}} A:")],
            chat_sep: Some(vec![text("\n")]),
            suffix: vec![ContextUnit::Tokens(vec![2])],
        }
    }

    fn render(context: &Context) -> Vec<(String, f32)> {
        context
            .iter()
            .map(|(unit, w)| match unit {
                ContextUnit::Text(s) => (s.clone(), w),
                ContextUnit::Tokens(ids) => (format!("{ids:?}"), w),
                ContextUnit::Marker(m) => (m.tag().to_string(), w),
            })
            .collect()
    }

    #[test]
    fn test_substitute_is_single_pass() {
        let values = Substitutions {
            system: Some("{{QUERY}}"),
            query: Some("q"),
            round: Some(0),
            ..Default::default()
        };
        assert_eq!(
            substitute("{{SYSTEM}}-{{QUERY}}-{{ROUND0}}-{{ROUND1}}", &values),
            "{{QUERY}}-q-0-1"
        );
        let empty = Substitutions::default();
        assert_eq!(substitute("keep {{QUERY}}", &empty), "keep {{QUERY}}");
    }

    #[test]
    fn test_build_single_round() {
        let scale = LossScale::Default;
        let builder = ContextBuilder::new(&scale, false);
        let example = ConversationExample::new("hi").with_response("yo");
        let context = builder
            .build(&prompts(), &example, None, example.response.as_deref())
            .unwrap();
        assert_eq!(
            render(&context),
            vec![
                ("U1:hi A:".to_string(), 0.0),
                ("yo".to_string(), 1.0),
                ("[2]".to_string(), 1.0),
            ]
        );
    }

    #[test]
    fn test_build_history_and_system() {
        let scale = LossScale::Default;
        let builder = ContextBuilder::new(&scale, false);
        let example = ConversationExample::new("q2")
            .with_response("r2")
            .with_history(vec![HistoryTurn::tool("q1", "r1")]);
        let context = builder
            .build(&prompts(), &example, Some("sys"), Some("r2"))
            .unwrap();
        let rendered = render(&context);
        assert_eq!(rendered[0], ("S:sys|".to_string(), 0.0));
        assert_eq!(rendered[1], ("T:q1 A:".to_string(), 0.0));
        assert_eq!(rendered[2], ("r1".to_string(), 0.0));
        assert_eq!(rendered[3], ("\n".to_string(), 0.0));
        assert_eq!(rendered[4], ("U2:q2 A:".to_string(), 0.0));
        assert_eq!(rendered[5], ("r2".to_string(), 1.0));
    }

    #[test]
    fn test_build_per_round_loss_and_empty_next_query() {
        let scale = LossScale::Default;
        let builder = ContextBuilder::new(&scale, true);
        let example = ConversationExample::new("")
            .with_response("tail")
            .with_history(vec![HistoryTurn::new("q1", "r1")]);
        let context = builder.build(&prompts(), &example, None, Some("tail")).unwrap();
        let rendered = render(&context);
        assert!(rendered.contains(&("r1".to_string(), 1.0)));
        // next query is empty: no separator
        assert!(!rendered.iter().any(|(t, _)| t == "\n"));
    }

    #[test]
    fn test_build_generation_omits_suffix() {
        let scale = LossScale::Default;
        let builder = ContextBuilder::new(&scale, false);
        let example = ConversationExample::new("hi");
        let context = builder.build(&prompts(), &example, None, None).unwrap();
        assert_eq!(render(&context), vec![("U1:hi A:".to_string(), 0.0)]);
    }

    #[test]
    fn test_build_generation_with_empty_query_keeps_prompt() {
        let scale = LossScale::Default;
        let builder = ContextBuilder::new(&scale, false);
        let example = ConversationExample::new("")
            .with_history(vec![HistoryTurn::new("", ""), HistoryTurn::new("q1", "r1")]);
        let context = builder.build(&prompts(), &example, Some("sys"), None).unwrap();
        let rendered = render(&context);
        assert_eq!(rendered[0], ("S:sys|".to_string(), 0.0));
        // the empty historical round is skipped
        assert_eq!(rendered[1], ("U2:q1 A:".to_string(), 0.0));
        assert_eq!(rendered.last(), Some(&("U3: A:".to_string(), 0.0)));
    }

    #[test]
    fn test_simplify_merges_zero_weight_text() {
        let mut context = Context::default();
        context.push(text("a"), 0.0);
        context.push(text("b"), 0.0);
        context.push(ContextUnit::Tokens(vec![7]), 0.0);
        context.push(text("c"), 0.0);
        context.push(text("d"), 1.0);
        context.push(text(""), 1.0);
        let simplified = context.simplify();
        assert_eq!(
            simplified.units(),
            &[text("ab"), ContextUnit::Tokens(vec![7]), text("c"), text("d")]
        );
        assert_eq!(simplified.weights(), &[0.0, 0.0, 0.0, 1.0]);
    }

    #[test]
    fn test_split_markers_inherits_weight() {
        let mut context = Context::default();
        context.push(text("see <image> and <bbox>"), 0.5);
        let split = context.split_markers(&[Marker::Media(MediaKind::Image)]);
        assert_eq!(
            split.units(),
            &[
                text("see "),
                ContextUnit::Marker(Marker::Media(MediaKind::Image)),
                text(" and <bbox>"),
            ]
        );
        assert!(split.weights().iter().all(|w| *w == 0.5));
    }
}
