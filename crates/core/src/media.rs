//! Media markers, media references and the media processor boundary.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Result, TemplateError};
use crate::example::ConversationExample;

/// Matches every reserved marker. Longest alternatives do not overlap.
static MARKER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<image>|<video>|<audio>|<ref-object>|<bbox>").unwrap());

/// Kind of media attached to an example.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
    Audio,
}

impl MediaKind {
    pub const ALL: [MediaKind; 3] = [MediaKind::Image, MediaKind::Video, MediaKind::Audio];

    /// The standard marker placed in conversation text.
    pub fn tag(self) -> &'static str {
        match self {
            MediaKind::Image => "<image>",
            MediaKind::Video => "<video>",
            MediaKind::Audio => "<audio>",
        }
    }

    /// Key under which processed tensors of this kind are collated.
    pub fn side_channel_key(self) -> &'static str {
        match self {
            MediaKind::Image => "pixel_values",
            MediaKind::Video => "pixel_values_videos",
            MediaKind::Audio => "input_features",
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MediaKind::Image => "image",
            MediaKind::Video => "video",
            MediaKind::Audio => "audio",
        })
    }
}

/// A reserved placeholder resolved per model family during encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Marker {
    Media(MediaKind),
    RefObject,
    Bbox,
}

impl Marker {
    pub fn tag(self) -> &'static str {
        match self {
            Marker::Media(kind) => kind.tag(),
            Marker::RefObject => "<ref-object>",
            Marker::Bbox => "<bbox>",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "<image>" => Some(Marker::Media(MediaKind::Image)),
            "<video>" => Some(Marker::Media(MediaKind::Video)),
            "<audio>" => Some(Marker::Media(MediaKind::Audio)),
            "<ref-object>" => Some(Marker::RefObject),
            "<bbox>" => Some(Marker::Bbox),
            _ => None,
        }
    }
}

impl fmt::Display for Marker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Marker::Media(kind) => kind.fmt(f),
            Marker::RefObject => f.write_str("ref-object"),
            Marker::Bbox => f.write_str("bbox"),
        }
    }
}

/// Split `text` around reserved markers.
///
/// Yields `(piece, marker)` pairs in order; `marker` is `Some` for a piece that
/// is exactly one marker. Markers not in `supported` stay inside plain pieces.
pub fn split_markers<'a>(text: &'a str, supported: &[Marker]) -> Vec<(&'a str, Option<Marker>)> {
    let mut pieces = Vec::new();
    let mut last = 0;
    for m in MARKER_RE.find_iter(text) {
        let Some(marker) = Marker::from_tag(m.as_str()).filter(|mk| supported.contains(mk)) else {
            continue;
        };
        if m.start() > last {
            pieces.push((&text[last..m.start()], None));
        }
        pieces.push((m.as_str(), Some(marker)));
        last = m.end();
    }
    if last < text.len() {
        pieces.push((&text[last..], None));
    }
    pieces
}

/// Count occurrences of `marker` in `text`.
pub fn count_marker(text: &str, marker: Marker) -> usize {
    text.matches(marker.tag()).count()
}

/// A reference to one media item (path, URL or inline payload).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MediaRef(pub String);

impl MediaRef {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for MediaRef {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for MediaRef {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// A dense tensor produced for a media item, batched by concatenation on dim 0.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SideChannel {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

impl SideChannel {
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Self {
        Self { shape, data }
    }

    /// Concatenate along the first dimension. Trailing dimensions must agree.
    pub fn concat(parts: &[SideChannel]) -> Result<SideChannel> {
        let Some(first) = parts.first() else {
            return Ok(SideChannel::default());
        };
        let tail = first.shape.get(1..).unwrap_or(&[]);
        let mut lead = 0;
        let mut data = Vec::with_capacity(parts.iter().map(|p| p.data.len()).sum());
        for part in parts {
            if part.shape.get(1..).unwrap_or(&[]) != tail {
                return Err(TemplateError::InvalidExample(format!(
                    "side channel shape {:?} does not stack with {:?}",
                    part.shape, first.shape
                )));
            }
            lead += part.shape.first().copied().unwrap_or(0);
            data.extend_from_slice(&part.data);
        }
        let mut shape = vec![lead];
        shape.extend_from_slice(tail);
        Ok(SideChannel { shape, data })
    }
}

/// Model-side preprocessing of media items (vision towers, audio feature
/// extractors). Supplied by the owning model; the encoder only calls it.
pub trait MediaProcessor: fmt::Debug + Send + Sync {
    fn process(&self, kind: MediaKind, media: &MediaRef) -> Result<SideChannel>;
}

/// Rewrites a dataset-specific media tag into the standard marker.
#[derive(Debug, Clone)]
pub struct MediaTagReplacer {
    pub kind: MediaKind,
    pub media_tag: String,
}

impl MediaTagReplacer {
    pub fn new(kind: MediaKind, media_tag: impl Into<String>) -> Self {
        Self {
            kind,
            media_tag: media_tag.into(),
        }
    }

    /// Replace the tag in every query after checking it appears once per item.
    ///
    /// Examples that never mention the tag are left untouched.
    pub fn apply(&self, example: &mut ConversationExample) -> Result<()> {
        let tag = self.media_tag.as_str();
        let occurrences: usize = example
            .history
            .iter()
            .map(|turn| turn.query.matches(tag).count())
            .sum::<usize>()
            + example.query.matches(tag).count();
        if occurrences == 0 {
            return Ok(());
        }
        let items = example.media(self.kind).len();
        if occurrences != items {
            return Err(TemplateError::MediaCountMismatch {
                kind: self.kind.to_string(),
                markers: occurrences,
                items,
            });
        }
        let standard = self.kind.tag();
        for turn in &mut example.history {
            turn.query = turn.query.replace(tag, standard);
        }
        example.query = example.query.replace(tag, standard);
        Ok(())
    }
}

/// Prompt language for grounding tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptLanguage {
    En,
    Zh,
}

/// Grounding tasks that synthesize the query/response pair from objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroundingTask {
    /// Ask for the box of a named object.
    RefGrounding,
    /// Ask for the name of the object in a box.
    GroundingCaption,
}

const REF_GROUNDING_EN: &[(&str, &str)] = &[
    ("<ref-object>", "<bbox>"),
    ("The positions of <ref-object> is", "<bbox>"),
    ("Find the positions of <ref-object>", "<bbox>"),
    ("Where is <ref-object>", "<bbox>"),
    ("Find <ref-object>", "<bbox>"),
    ("Show me <ref-object>", "<bbox>"),
    ("Provide the bounding box coordinate of <ref-object>", "<bbox>"),
];

const REF_GROUNDING_ZH: &[(&str, &str)] = &[
    ("<ref-object>", "<bbox>"),
    ("<ref-object>的位置在图片中", "<bbox>"),
    ("<ref-object>在图片中", "<bbox>"),
    ("<ref-object>在", "<bbox>"),
    ("找到<ref-object>的位置", "<bbox>"),
    ("<ref-object>在哪里", "<bbox>"),
    ("提供<ref-object>的坐标位置", "<bbox>"),
];

const GROUNDING_CAPTION_EN: &[(&str, &str)] = &[
    ("<bbox>", "<ref-object>"),
    ("The object at position <bbox>", "<ref-object>"),
    ("This <bbox> is", "<ref-object>"),
    ("What is the thing at <bbox>", "<ref-object>"),
    ("Describe <bbox>", "<ref-object>"),
    ("<bbox> is", "<ref-object>"),
    ("The bounding box coordinate <bbox> contains", "<ref-object>"),
];

const GROUNDING_CAPTION_ZH: &[(&str, &str)] = &[
    ("<bbox>", "<ref-object>"),
    ("<bbox>是什么", "<ref-object>"),
    ("<bbox>的位置包含", "<ref-object>"),
    ("描述<bbox>", "<ref-object>"),
    ("<bbox>中是", "<ref-object>"),
    ("坐标<bbox>描述了什么", "<ref-object>"),
    ("描述<bbox>中的事物", "<ref-object>"),
];

impl GroundingTask {
    pub fn prompts(self, language: PromptLanguage) -> &'static [(&'static str, &'static str)] {
        match (self, language) {
            (GroundingTask::RefGrounding, PromptLanguage::En) => REF_GROUNDING_EN,
            (GroundingTask::RefGrounding, PromptLanguage::Zh) => REF_GROUNDING_ZH,
            (GroundingTask::GroundingCaption, PromptLanguage::En) => GROUNDING_CAPTION_EN,
            (GroundingTask::GroundingCaption, PromptLanguage::Zh) => GROUNDING_CAPTION_ZH,
        }
    }

    /// Overwrite the example's query and response with prompt `selector`
    /// (taken modulo the catalog size).
    pub fn apply(self, example: &mut ConversationExample, language: PromptLanguage, selector: usize) {
        let prompts = self.prompts(language);
        let (query, response) = prompts[selector % prompts.len()];
        example.query = query.to_string();
        example.response = Some(response.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::example::HistoryTurn;

    #[test]
    fn test_split_markers_keeps_unsupported_inline() {
        let supported = [Marker::Media(MediaKind::Image)];
        let pieces = split_markers("a<image>b<audio>c", &supported);
        assert_eq!(
            pieces,
            vec![
                ("a", None),
                ("<image>", Some(Marker::Media(MediaKind::Image))),
                ("b<audio>c", None),
            ]
        );
    }

    #[test]
    fn test_split_markers_adjacent() {
        let supported = [Marker::RefObject, Marker::Bbox];
        let pieces = split_markers("<ref-object><bbox>", &supported);
        assert_eq!(pieces.len(), 2);
        assert_eq!(pieces[0].1, Some(Marker::RefObject));
        assert_eq!(pieces[1].1, Some(Marker::Bbox));
    }

    #[test]
    fn test_side_channel_concat() {
        let a = SideChannel::new(vec![1, 2], vec![1.0, 2.0]);
        let b = SideChannel::new(vec![2, 2], vec![3.0, 4.0, 5.0, 6.0]);
        let joined = SideChannel::concat(&[a, b]).unwrap();
        assert_eq!(joined.shape, vec![3, 2]);
        assert_eq!(joined.data.len(), 6);

        let bad = SideChannel::new(vec![1, 3], vec![0.0; 3]);
        let ok = SideChannel::new(vec![1, 2], vec![0.0; 2]);
        assert!(SideChannel::concat(&[ok, bad]).is_err());
    }

    #[test]
    fn test_media_tag_replacer() {
        let mut example = ConversationExample {
            query: "look <img_tag>".to_string(),
            history: vec![HistoryTurn::new("first <img_tag>", "ok")],
            images: vec!["a.png".into(), "b.png".into()],
            ..Default::default()
        };
        MediaTagReplacer::new(MediaKind::Image, "<img_tag>")
            .apply(&mut example)
            .unwrap();
        assert_eq!(example.query, "look <image>");
        assert_eq!(example.history[0].query, "first <image>");

        let mut short = ConversationExample {
            query: "<img_tag><img_tag>".to_string(),
            images: vec!["a.png".into()],
            ..Default::default()
        };
        let err = MediaTagReplacer::new(MediaKind::Image, "<img_tag>").apply(&mut short);
        assert!(matches!(err, Err(TemplateError::MediaCountMismatch { markers: 2, items: 1, .. })));
    }

    #[test]
    fn test_grounding_task_selection_wraps() {
        let mut example = ConversationExample::default();
        GroundingTask::GroundingCaption.apply(&mut example, PromptLanguage::En, 8);
        assert_eq!(example.query, "The object at position <bbox>");
        assert_eq!(example.response.as_deref(), Some("<ref-object>"));
    }
}
