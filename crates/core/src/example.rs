//! Conversation examples: the typed form the encoder consumes and the raw
//! serialized form datasets provide.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TemplateError};
use crate::media::{MediaKind, MediaRef};

/// Role of the speaker of a query turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryRole {
    #[default]
    User,
    /// Tool output fed back to the model (formatted with the tool prompt).
    Tool,
}

impl FromStr for QueryRole {
    type Err = TemplateError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "user" => Ok(QueryRole::User),
            "tool" => Ok(QueryRole::Tool),
            other => Err(TemplateError::InvalidExample(format!(
                "unsupported query role `{other}`"
            ))),
        }
    }
}

/// A completed historical round.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HistoryTurn {
    pub query: String,
    pub response: String,
    pub query_role: QueryRole,
}

impl HistoryTurn {
    pub fn new(query: impl Into<String>, response: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            response: response.into(),
            query_role: QueryRole::User,
        }
    }

    pub fn tool(query: impl Into<String>, response: impl Into<String>) -> Self {
        Self {
            query_role: QueryRole::Tool,
            ..Self::new(query, response)
        }
    }
}

/// A labelled bounding box for grounding tasks.
#[derive(Debug, Clone, PartialEq)]
pub struct GroundingObject {
    pub label: String,
    /// `[x0, y0, x1, y1]`
    pub bbox: [f64; 4],
}

/// One multi-turn, optionally multi-modal conversation.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ConversationExample {
    pub system: Option<String>,
    pub query: String,
    pub query_role: QueryRole,
    /// Absent for generation-only encoding.
    pub response: Option<String>,
    pub history: Vec<HistoryTurn>,
    /// Callable specs rendered into the system text.
    pub tools: Vec<serde_json::Value>,
    pub images: Vec<MediaRef>,
    pub videos: Vec<MediaRef>,
    pub audios: Vec<MediaRef>,
    pub objects: Vec<GroundingObject>,
}

impl ConversationExample {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Default::default()
        }
    }

    pub fn with_response(mut self, response: impl Into<String>) -> Self {
        self.response = Some(response.into());
        self
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_history(mut self, history: Vec<HistoryTurn>) -> Self {
        self.history = history;
        self
    }

    pub fn media(&self, kind: MediaKind) -> &[MediaRef] {
        match kind {
            MediaKind::Image => &self.images,
            MediaKind::Video => &self.videos,
            MediaKind::Audio => &self.audios,
        }
    }

    /// Every query in conversation order, the current one last.
    pub fn queries(&self) -> impl Iterator<Item = &str> {
        self.history
            .iter()
            .map(|turn| turn.query.as_str())
            .chain(std::iter::once(self.query.as_str()))
    }

    /// Build an example from chat messages.
    ///
    /// An optional leading `system` message is followed by alternating
    /// `user`/`tool` and `assistant` messages. The last pair becomes the
    /// query/response; its assistant message may be missing.
    pub fn from_messages(messages: &[Message]) -> Result<Self> {
        let mut rest = messages;
        let mut system = None;
        if let Some(first) = rest.first() {
            if first.role == "system" {
                system = Some(first.content.clone());
                rest = &rest[1..];
            }
        }
        if rest.is_empty() {
            return Err(TemplateError::InvalidExample(
                "messages contain no user turn".to_string(),
            ));
        }

        let mut rounds: Vec<(QueryRole, String, Option<String>)> = Vec::new();
        for pair in rest.chunks(2) {
            let query_role: QueryRole = pair[0].role.parse()?;
            let response = match pair.get(1) {
                Some(m) if m.role == "assistant" => Some(m.content.clone()),
                Some(m) => {
                    return Err(TemplateError::InvalidExample(format!(
                        "expected an assistant message after `{}`, got `{}`",
                        pair[0].role, m.role
                    )))
                }
                None => None,
            };
            rounds.push((query_role, pair[0].content.clone(), response));
        }

        let (query_role, query, response) = rounds.pop().unwrap_or_default();
        let history = rounds
            .into_iter()
            .map(|(query_role, query, response)| HistoryTurn {
                query,
                response: response.unwrap_or_default(),
                query_role,
            })
            .collect();

        Ok(Self {
            system,
            query,
            query_role,
            response,
            history,
            ..Default::default()
        })
    }
}

/// A chat message in `{"role", "content"}` form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

impl Message {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }
}

/// A single media ref or a list of them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    fn into_refs(self) -> Vec<MediaRef> {
        match self {
            OneOrMany::One(s) if s.is_empty() => Vec::new(),
            OneOrMany::One(s) => vec![MediaRef(s)],
            OneOrMany::Many(v) => v.into_iter().map(MediaRef).collect(),
        }
    }
}

/// Objects as a list of `(label, [x0, y0, x1, y1])`, or that list serialized
/// to a JSON string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ObjectsPayload {
    List(Vec<(String, Vec<f64>)>),
    Serialized(String),
}

impl ObjectsPayload {
    fn into_objects(self) -> Result<Vec<GroundingObject>> {
        let list = match self {
            ObjectsPayload::List(list) => list,
            ObjectsPayload::Serialized(s) if s.trim().is_empty() => Vec::new(),
            ObjectsPayload::Serialized(s) => serde_json::from_str(&s)?,
        };
        list.into_iter()
            .map(|(label, bbox)| {
                let bbox: [f64; 4] = bbox.as_slice().try_into().map_err(|_| {
                    TemplateError::InvalidExample(format!(
                        "bbox for `{label}` must have 4 coordinates, got {}",
                        bbox.len()
                    ))
                })?;
                Ok(GroundingObject { label, bbox })
            })
            .collect()
    }
}

/// An example as it appears in a dataset file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawExample {
    #[serde(default)]
    pub query: Option<String>,
    #[serde(default)]
    pub query_role: Option<String>,
    #[serde(default)]
    pub response: Option<String>,
    #[serde(default)]
    pub history: Option<Vec<(String, String)>>,
    #[serde(default)]
    pub history_roles: Option<Vec<(String, String)>>,
    #[serde(default)]
    pub system: Option<String>,
    #[serde(default)]
    pub tools: Option<Vec<serde_json::Value>>,
    #[serde(default)]
    pub images: Option<OneOrMany>,
    #[serde(default)]
    pub videos: Option<OneOrMany>,
    #[serde(default)]
    pub audios: Option<OneOrMany>,
    #[serde(default)]
    pub objects: Option<ObjectsPayload>,
    /// Alternative to `query`/`response`/`history`.
    #[serde(default)]
    pub messages: Option<Vec<Message>>,
}

impl TryFrom<RawExample> for ConversationExample {
    type Error = TemplateError;

    fn try_from(raw: RawExample) -> Result<Self> {
        let mut example = match raw.messages {
            Some(messages) => ConversationExample::from_messages(&messages)?,
            None => {
                let query = raw.query.ok_or_else(|| {
                    TemplateError::InvalidExample("missing `query`".to_string())
                })?;
                let history = raw.history.unwrap_or_default();
                let roles = match raw.history_roles {
                    Some(roles) if roles.len() != history.len() => {
                        return Err(TemplateError::InvalidExample(format!(
                            "{} history_roles for {} history rounds",
                            roles.len(),
                            history.len()
                        )))
                    }
                    Some(roles) => roles
                        .into_iter()
                        .map(|(query_role, _)| query_role.parse())
                        .collect::<Result<Vec<QueryRole>>>()?,
                    None => vec![QueryRole::User; history.len()],
                };
                let history = history
                    .into_iter()
                    .zip(roles)
                    .map(|((query, response), query_role)| HistoryTurn {
                        query,
                        response,
                        query_role,
                    })
                    .collect();
                ConversationExample {
                    query,
                    query_role: match raw.query_role {
                        Some(role) => role.parse()?,
                        None => QueryRole::User,
                    },
                    response: raw.response,
                    history,
                    ..Default::default()
                }
            }
        };

        if raw.system.is_some() {
            example.system = raw.system;
        }
        example.tools = raw.tools.unwrap_or_default();
        example.images = raw.images.map(OneOrMany::into_refs).unwrap_or_default();
        example.videos = raw.videos.map(OneOrMany::into_refs).unwrap_or_default();
        example.audios = raw.audios.map(OneOrMany::into_refs).unwrap_or_default();
        example.objects = match raw.objects {
            Some(payload) => payload.into_objects()?,
            None => Vec::new(),
        };
        Ok(example)
    }
}
