//! Per-unit loss weights for response text.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Result, TemplateError};

/// Weight of a keyword and of the content that follows it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeywordWeight {
    pub keyword: String,
    pub keyword_weight: f32,
    pub content_weight: f32,
}

impl KeywordWeight {
    pub fn new(keyword: impl Into<String>, keyword_weight: f32, content_weight: f32) -> Self {
        Self {
            keyword: keyword.into(),
            keyword_weight,
            content_weight,
        }
    }
}

static AGENT_KEYWORDS: LazyLock<Vec<KeywordWeight>> = LazyLock::new(|| {
    vec![
        KeywordWeight::new("Action Input:", 1.0, 1.0),
        KeywordWeight::new("Action:", 1.0, 1.0),
        KeywordWeight::new("Thought:", 1.0, 1.0),
        KeywordWeight::new("Final Answer:", 1.0, 1.0),
        // Tool output copied into the response is not the model's to learn.
        KeywordWeight::new("Observation:", 1.0, 0.0),
    ]
});

static AGENT_RE: LazyLock<Regex> = LazyLock::new(|| keyword_regex(&AGENT_KEYWORDS).unwrap());

fn keyword_regex(keywords: &[KeywordWeight]) -> Result<Regex> {
    let mut sorted: Vec<&str> = keywords.iter().map(|k| k.keyword.as_str()).collect();
    // Longest first so `Action Input:` wins over `Action:`.
    sorted.sort_by_key(|k| std::cmp::Reverse(k.len()));
    let pattern = sorted
        .iter()
        .map(|k| regex::escape(k))
        .collect::<Vec<_>>()
        .join("|");
    Regex::new(&pattern).map_err(|e| TemplateError::InvalidLossScale(e.to_string()))
}

/// How the response is split into weighted units.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LossScale {
    /// The whole response with weight 1.0.
    #[default]
    Default,
    /// ReAct agent responses, keyed on `Thought:`/`Action:`/`Observation:`...
    Agent,
    /// Custom keyword weights.
    Keywords(Vec<KeywordWeight>),
}

impl LossScale {
    /// Reject weights outside `[0, 1]` and empty keywords.
    pub fn validate(&self) -> Result<()> {
        let LossScale::Keywords(keywords) = self else {
            return Ok(());
        };
        if keywords.is_empty() {
            return Err(TemplateError::InvalidLossScale(
                "keyword map is empty".to_string(),
            ));
        }
        for k in keywords {
            if k.keyword.is_empty() {
                return Err(TemplateError::InvalidLossScale("empty keyword".to_string()));
            }
            for w in [k.keyword_weight, k.content_weight] {
                if !(0.0..=1.0).contains(&w) {
                    return Err(TemplateError::InvalidLossScale(format!(
                        "weight {w} for `{}` is outside [0, 1]",
                        k.keyword
                    )));
                }
            }
        }
        Ok(())
    }

    /// Split `response` into `(text, weight)` pieces that concatenate back to it.
    pub fn calculate(&self, response: &str) -> Result<Vec<(String, f32)>> {
        match self {
            LossScale::Default => Ok(vec![(response.to_string(), 1.0)]),
            LossScale::Agent => Ok(split_by_keywords(response, &AGENT_KEYWORDS, &AGENT_RE)),
            LossScale::Keywords(keywords) => {
                let re = keyword_regex(keywords)?;
                Ok(split_by_keywords(response, keywords, &re))
            }
        }
    }
}

fn split_by_keywords(response: &str, keywords: &[KeywordWeight], re: &Regex) -> Vec<(String, f32)> {
    let mut pieces = Vec::new();
    let mut content_weight = 1.0;
    let mut last = 0;
    for m in re.find_iter(response) {
        if m.start() > last {
            pieces.push((response[last..m.start()].to_string(), content_weight));
        }
        let Some(k) = keywords.iter().find(|k| k.keyword == m.as_str()) else {
            continue;
        };
        pieces.push((m.as_str().to_string(), k.keyword_weight));
        content_weight = k.content_weight;
        last = m.end();
    }
    if last < response.len() || pieces.is_empty() {
        pieces.push((response[last..].to_string(), content_weight));
    }
    pieces
}
