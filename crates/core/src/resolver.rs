//! Per-family marker resolution.
//!
//! Each model family supplies one [`ModelStrategy`] that decides which
//! markers it understands, validates examples against them and turns each
//! marker unit into text, a sentinel id or a literal id list.

use std::collections::HashMap;
use std::fmt;

use serde_json::Value;

use crate::context::{Context, ContextUnit};
use crate::encoder::{EncodedExample, TokenizerKwargs};
use crate::error::{Result, TemplateError};
use crate::example::{ConversationExample, GroundingObject};
use crate::media::{count_marker, MediaKind, MediaRef, Marker};
use crate::Tokenizer;

/// Sentinel id standing in for an image until the model splices in features.
pub const IMAGE_TOKEN_INDEX: i64 = -200;
/// Sentinel id standing in for a video.
pub const VIDEO_TOKEN_INDEX: i64 = -300;

/// Per-example state threaded through resolution. Lives for one encode call.
#[derive(Clone)]
pub struct EncodeContext<'a> {
    pub template_id: &'a str,
    pub example: &'a ConversationExample,
    pub tokenizer: &'a dyn Tokenizer,
    counters: HashMap<Marker, usize>,
}

impl<'a> EncodeContext<'a> {
    pub fn new(template_id: &'a str, example: &'a ConversationExample, tokenizer: &'a dyn Tokenizer) -> Self {
        Self {
            template_id,
            example,
            tokenizer,
            counters: HashMap::new(),
        }
    }

    /// Return the position for `marker` and advance its counter.
    pub fn next_index(&mut self, marker: Marker) -> usize {
        let counter = self.counters.entry(marker).or_insert(0);
        let index = *counter;
        *counter += 1;
        index
    }

    /// How many `marker` units have been resolved so far.
    pub fn resolved(&self, marker: Marker) -> usize {
        self.counters.get(&marker).copied().unwrap_or(0)
    }

    fn encode_ids(&self, text: &str) -> Result<Vec<i64>> {
        Ok(self
            .tokenizer
            .encode(text, false)?
            .into_iter()
            .map(i64::from)
            .collect())
    }
}

impl fmt::Debug for EncodeContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncodeContext")
            .field("template_id", &self.template_id)
            .field("counters", &self.counters)
            .finish()
    }
}

/// What a marker unit becomes.
#[derive(Debug, Clone, PartialEq)]
pub enum Replacement {
    /// Text tokenized in place of the marker.
    Text(String),
    /// One sentinel id located and replaced downstream.
    Sentinel(i64),
    /// Literal ids.
    Tokens(Vec<i64>),
}

impl From<Replacement> for ContextUnit {
    fn from(replacement: Replacement) -> Self {
        match replacement {
            Replacement::Text(text) => ContextUnit::Text(text),
            Replacement::Sentinel(id) => ContextUnit::Tokens(vec![id]),
            Replacement::Tokens(ids) => ContextUnit::Tokens(ids),
        }
    }
}

/// Check that each supported media kind is referenced once per item and that
/// no unsupported kind carries items.
pub fn validate_media_counts(
    supported: &[Marker],
    template_id: &str,
    example: &ConversationExample,
) -> Result<()> {
    for kind in MediaKind::ALL {
        let items = example.media(kind).len();
        let marker = Marker::Media(kind);
        if !supported.contains(&marker) {
            if items > 0 {
                return Err(TemplateError::UnsupportedMedia {
                    template: template_id.to_string(),
                    kind: kind.to_string(),
                });
            }
            continue;
        }
        let markers: usize = example.queries().map(|q| count_marker(q, marker)).sum();
        if markers != items {
            return Err(TemplateError::MediaCountMismatch {
                kind: kind.to_string(),
                markers,
                items,
            });
        }
    }
    Ok(())
}

/// Extension points a model family customises.
pub trait ModelStrategy: fmt::Debug + Send + Sync {
    fn name(&self) -> &'static str;

    /// Markers split out of text and routed to [`ModelStrategy::resolve_marker`].
    fn supported_markers(&self) -> &'static [Marker] {
        &[]
    }

    fn validate_example(&self, template_id: &str, example: &ConversationExample) -> Result<()> {
        validate_media_counts(self.supported_markers(), template_id, example)
    }

    fn resolve_marker(&self, marker: Marker, ctx: &mut EncodeContext<'_>) -> Result<Replacement> {
        ctx.next_index(marker);
        Ok(Replacement::Text(marker.tag().to_string()))
    }

    /// Replace every marker unit with its resolution.
    fn pre_tokenize(&self, context: Context, ctx: &mut EncodeContext<'_>) -> Result<Context> {
        let mut out = Context::default();
        for (unit, weight) in context {
            match unit {
                ContextUnit::Marker(marker) => {
                    out.push(self.resolve_marker(marker, ctx)?.into(), weight)
                }
                unit => out.push(unit, weight),
            }
        }
        Ok(out)
    }

    fn post_encode(
        &self,
        _encoded: &mut EncodedExample,
        _kwargs: &mut TokenizerKwargs,
        _ctx: &EncodeContext<'_>,
    ) -> Result<()> {
        Ok(())
    }
}

/// Text-only families.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainStrategy;

impl ModelStrategy for PlainStrategy {
    fn name(&self) -> &'static str {
        "plain"
    }
}

fn object_at<'a>(ctx: &mut EncodeContext<'a>, marker: Marker) -> Result<&'a GroundingObject> {
    let index = ctx.next_index(marker);
    let example: &'a ConversationExample = ctx.example;
    let objects = &example.objects;
    objects
        .get(index)
        .ok_or_else(|| TemplateError::MediaCountMismatch {
            kind: "object".to_string(),
            markers: index + 1,
            items: objects.len(),
        })
}

/// Advance the counter for a media marker and return the matching item.
/// A marker beyond the supplied items is a count mismatch, whatever text it
/// came from.
fn media_at<'a>(ctx: &mut EncodeContext<'a>, kind: MediaKind) -> Result<(usize, &'a MediaRef)> {
    let index = ctx.next_index(Marker::Media(kind));
    let example: &'a ConversationExample = ctx.example;
    let items = example.media(kind);
    items
        .get(index)
        .map(|media| (index, media))
        .ok_or_else(|| TemplateError::MediaCountMismatch {
            kind: kind.to_string(),
            markers: index + 1,
            items: items.len(),
        })
}

fn format_coord(value: f64) -> String {
    if value.fract() == 0.0 {
        format!("{value:.0}")
    } else {
        value.to_string()
    }
}

/// Qwen-VL: images, objects and boxes as inline textual tags.
#[derive(Debug, Clone, Copy, Default)]
pub struct QwenVlStrategy;

impl ModelStrategy for QwenVlStrategy {
    fn name(&self) -> &'static str {
        "qwen-vl"
    }

    fn supported_markers(&self) -> &'static [Marker] {
        &[Marker::Media(MediaKind::Image), Marker::RefObject, Marker::Bbox]
    }

    fn resolve_marker(&self, marker: Marker, ctx: &mut EncodeContext<'_>) -> Result<Replacement> {
        match marker {
            Marker::Media(MediaKind::Image) => {
                let (index, path) = media_at(ctx, MediaKind::Image)?;
                Ok(Replacement::Text(format!("Picture {}: <img>{}</img>\n", index + 1, path.as_str())))
            }
            Marker::RefObject => {
                let object = object_at(ctx, marker)?;
                Ok(Replacement::Text(format!("<ref>{}</ref>", object.label)))
            }
            Marker::Bbox => {
                let object = object_at(ctx, marker)?;
                let [x0, y0, x1, y1] = object.bbox.map(format_coord);
                Ok(Replacement::Text(format!("<box>({x0},{y0}),({x1},{y1})</box>")))
            }
            other => Ok(Replacement::Text(other.tag().to_string())),
        }
    }
}

/// Qwen-Audio: audio clips as inline textual tags.
#[derive(Debug, Clone, Copy, Default)]
pub struct QwenAudioStrategy;

impl ModelStrategy for QwenAudioStrategy {
    fn name(&self) -> &'static str {
        "qwen-audio"
    }

    fn supported_markers(&self) -> &'static [Marker] {
        &[Marker::Media(MediaKind::Audio)]
    }

    fn resolve_marker(&self, marker: Marker, ctx: &mut EncodeContext<'_>) -> Result<Replacement> {
        let Marker::Media(kind) = marker else {
            return Ok(Replacement::Text(marker.tag().to_string()));
        };
        let (index, path) = media_at(ctx, kind)?;
        Ok(Replacement::Text(format!("Audio {}:<audio>{}</audio>\n", index + 1, path.as_str())))
    }
}

/// LLaVA: one image per example, spliced in by the model at a sentinel id.
#[derive(Debug, Clone, Copy, Default)]
pub struct LlavaStrategy;

impl ModelStrategy for LlavaStrategy {
    fn name(&self) -> &'static str {
        "llava"
    }

    fn supported_markers(&self) -> &'static [Marker] {
        &[Marker::Media(MediaKind::Image), Marker::Media(MediaKind::Video)]
    }

    fn validate_example(&self, template_id: &str, example: &ConversationExample) -> Result<()> {
        if example.images.len() > 1 {
            return Err(TemplateError::SingleImageOnly {
                template: template_id.to_string(),
                count: example.images.len(),
            });
        }
        validate_media_counts(self.supported_markers(), template_id, example)
    }

    fn resolve_marker(&self, marker: Marker, ctx: &mut EncodeContext<'_>) -> Result<Replacement> {
        match marker {
            Marker::Media(MediaKind::Video) => {
                media_at(ctx, MediaKind::Video)?;
                Ok(Replacement::Sentinel(VIDEO_TOKEN_INDEX))
            }
            Marker::Media(MediaKind::Image) => {
                media_at(ctx, MediaKind::Image)?;
                Ok(Replacement::Sentinel(IMAGE_TOKEN_INDEX))
            }
            other => Ok(Replacement::Text(other.tag().to_string())),
        }
    }

    fn post_encode(
        &self,
        encoded: &mut EncodedExample,
        kwargs: &mut TokenizerKwargs,
        _ctx: &EncodeContext<'_>,
    ) -> Result<()> {
        let positions: Vec<usize> = encoded
            .input_ids
            .iter()
            .enumerate()
            .filter(|(_, id)| **id == IMAGE_TOKEN_INDEX || **id == VIDEO_TOKEN_INDEX)
            .map(|(i, _)| i)
            .collect();
        if !positions.is_empty() {
            kwargs.insert("image_positions", Value::from(positions));
        }
        Ok(())
    }
}

/// InternVL: each image becomes `<img>`, a run of context tokens, `</img>`.
#[derive(Debug, Clone, Copy)]
pub struct InternVlStrategy {
    pub num_image_token: usize,
}

impl Default for InternVlStrategy {
    fn default() -> Self {
        Self { num_image_token: 256 }
    }
}

pub const IMG_CONTEXT_TOKEN: &str = "<IMG_CONTEXT>";

impl ModelStrategy for InternVlStrategy {
    fn name(&self) -> &'static str {
        "internvl"
    }

    fn supported_markers(&self) -> &'static [Marker] {
        &[Marker::Media(MediaKind::Image)]
    }

    fn resolve_marker(&self, marker: Marker, ctx: &mut EncodeContext<'_>) -> Result<Replacement> {
        if marker != Marker::Media(MediaKind::Image) {
            return Ok(Replacement::Text(marker.tag().to_string()));
        }
        media_at(ctx, MediaKind::Image)?;
        let context_id = ctx
            .tokenizer
            .token_to_id(IMG_CONTEXT_TOKEN)
            .ok_or_else(|| TemplateError::MissingSpecialToken(IMG_CONTEXT_TOKEN.to_string()))?;
        let mut ids = ctx.encode_ids("<img>")?;
        ids.extend(std::iter::repeat(i64::from(context_id)).take(self.num_image_token));
        ids.extend(ctx.encode_ids("</img>\n")?);
        Ok(Replacement::Tokens(ids))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockTokenizer;

    fn marker_context(markers: &[Marker]) -> Context {
        let mut context = Context::default();
        for m in markers {
            context.push(ContextUnit::Marker(*m), 0.0);
        }
        context
    }

    #[test]
    fn test_validate_media_counts() {
        let supported = [Marker::Media(MediaKind::Image)];
        let mut example = ConversationExample::new("<image><image> what?");
        example.images = vec!["a".into(), "b".into()];
        validate_media_counts(&supported, "t", &example).unwrap();

        example.images.push("c".into());
        let err = validate_media_counts(&supported, "t", &example).unwrap_err();
        assert!(matches!(err, TemplateError::MediaCountMismatch { markers: 2, items: 3, .. }));

        example.query = "what?".to_string();
        example.images.clear();
        example.audios = vec!["x.wav".into()];
        let err = validate_media_counts(&supported, "t", &example).unwrap_err();
        assert!(matches!(err, TemplateError::UnsupportedMedia { .. }));
    }

    #[test]
    fn test_qwen_vl_tags() {
        let tokenizer = MockTokenizer::new();
        let mut example = ConversationExample::new("q");
        example.images = vec!["cat.png".into()];
        example.objects = vec![GroundingObject {
            label: "cat".to_string(),
            bbox: [10.0, 20.0, 30.5, 40.0],
        }];
        let mut ctx = EncodeContext::new("qwen-vl", &example, &tokenizer);
        let context = marker_context(&[
            Marker::Media(MediaKind::Image),
            Marker::RefObject,
            Marker::Bbox,
        ]);
        let resolved = QwenVlStrategy.pre_tokenize(context, &mut ctx).unwrap();
        assert_eq!(
            resolved.units(),
            &[
                ContextUnit::Text("Picture 1: <img>cat.png</img>\n".to_string()),
                ContextUnit::Text("<ref>cat</ref>".to_string()),
                ContextUnit::Text("<box>(10,20),(30.5,40)</box>".to_string()),
            ]
        );
        assert_eq!(ctx.resolved(Marker::Bbox), 1);

        let err = QwenVlStrategy.resolve_marker(Marker::Bbox, &mut ctx).unwrap_err();
        assert!(matches!(err, TemplateError::MediaCountMismatch { .. }));
    }

    #[test]
    fn test_llava_single_image() {
        let mut example = ConversationExample::new("<image><image>");
        example.images = vec!["a".into(), "b".into()];
        let err = LlavaStrategy.validate_example("llava", &example).unwrap_err();
        assert!(matches!(err, TemplateError::SingleImageOnly { count: 2, .. }));
    }

    #[test]
    fn test_internvl_expands_context_tokens() {
        let tokenizer = MockTokenizer::new();
        let mut example = ConversationExample::new("<image>");
        example.images = vec!["a.png".into()];
        let mut ctx = EncodeContext::new("internvl", &example, &tokenizer);
        let strategy = InternVlStrategy { num_image_token: 3 };
        let Replacement::Tokens(ids) = strategy
            .resolve_marker(Marker::Media(MediaKind::Image), &mut ctx)
            .unwrap()
        else {
            panic!("expected literal ids");
        };
        let context_id = i64::from(tokenizer.token_to_id(IMG_CONTEXT_TOKEN).unwrap());
        assert_eq!(ids.iter().filter(|id| **id == context_id).count(), 3);
        assert_eq!(&ids[..5], &[60, 105, 109, 103, 62]);
    }
}
