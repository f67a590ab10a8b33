//! Wire envelope for agent task messages.
//!
//! Every envelope travels as one JSON object on its own line:
//!
//! ```text
//! {"messageId":"<uuid>","role":"agent","parts":[{"text":"hello"}],"metadata":{"from":"Agent1","to":"Agent2"}}
//! ```
//!
//! Replies additionally carry `metadata.correlationId`, the `messageId` of the
//! request they answer.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::error::{MeshError, MeshResult};

/// Metadata key naming the sending agent
pub const META_FROM: &str = "from";
/// Metadata key naming the receiving agent
pub const META_TO: &str = "to";
/// Metadata key linking a reply to the request it answers
pub const META_CORRELATION_ID: &str = "correlationId";

/// Role of the message sender.
///
/// Roles other than `user` and `agent` are kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Message from a user (or a client agent acting for one)
    User,
    /// Message from an agent
    Agent,
    #[serde(untagged)]
    Other(String),
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::User => write!(f, "user"),
            Role::Agent => write!(f, "agent"),
            Role::Other(role) => f.write_str(role),
        }
    }
}

/// Text content part
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextPart {
    pub text: String,
}

/// A content part of an envelope.
///
/// Only text parts carry tasks; any other JSON object is preserved as-is so
/// that envelopes from richer peers still decode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Part {
    Text(TextPart),
    Other(serde_json::Value),
}

impl Part {
    /// Create a text part
    pub fn text(content: impl Into<String>) -> Self {
        Part::Text(TextPart {
            text: content.into(),
        })
    }

    /// Get the text content if this is a text part
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Part::Text(t) => Some(&t.text),
            Part::Other(_) => None,
        }
    }
}

/// A task message exchanged between agents.
///
/// Envelopes are immutable once built; the `with_*` helpers consume and
/// return a new value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    message_id: String,
    role: Role,
    #[serde(default)]
    parts: Vec<Part>,
    #[serde(default)]
    metadata: HashMap<String, serde_json::Value>,
}

impl Envelope {
    /// Create an envelope with a fresh message id
    pub fn new(role: Role, parts: Vec<Part>) -> Self {
        Self {
            message_id: Uuid::new_v4().to_string(),
            role,
            parts,
            metadata: HashMap::new(),
        }
    }

    /// Attach a string metadata entry
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata
            .insert(key.into(), serde_json::Value::String(value.into()));
        self
    }

    /// Mark this envelope as the reply to `request_id`
    pub fn with_correlation_id(self, request_id: impl Into<String>) -> Self {
        self.with_metadata(META_CORRELATION_ID, request_id)
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    pub fn role(&self) -> &Role {
        &self.role
    }

    pub fn parts(&self) -> &[Part] {
        &self.parts
    }

    /// Get a string metadata value by key
    pub fn get_metadata(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(|v| v.as_str())
    }

    /// The request this envelope answers, if it is a reply
    pub fn correlation_id(&self) -> Option<&str> {
        self.get_metadata(META_CORRELATION_ID)
    }

    /// First text part, if any
    pub fn text(&self) -> Option<&str> {
        self.parts.iter().find_map(Part::as_text)
    }

    /// Serialize to a single JSON line (without the trailing newline)
    pub fn to_json(&self) -> MeshResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Deserialize from JSON text
    pub fn from_json(json: &str) -> MeshResult<Self> {
        serde_json::from_str(json).map_err(|e| MeshError::MalformedPayload(e.to_string()))
    }
}

/// The task carried by an envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskRequest {
    pub text: String,
    pub from: Option<String>,
    pub to: Option<String>,
}

/// Build an envelope carrying a text task from `from` to `to`
pub fn build_task(text: impl Into<String>, from: impl Into<String>, to: impl Into<String>) -> Envelope {
    Envelope::new(Role::Agent, vec![Part::text(text)])
        .with_metadata(META_FROM, from)
        .with_metadata(META_TO, to)
}

/// Build the reply to `request`, swapping sender and recipient
pub fn build_reply(request: &Envelope, text: impl Into<String>, from: impl Into<String>) -> Envelope {
    let to = request.get_metadata(META_FROM).unwrap_or_default().to_string();
    build_task(text, from, to).with_correlation_id(request.message_id())
}

/// Extract the task from an envelope.
///
/// Returns `None` when the envelope has no text part: such an envelope is not
/// a task message and callers should ignore it.
pub fn parse_task(envelope: &Envelope) -> Option<TaskRequest> {
    let text = envelope.text()?;
    Some(TaskRequest {
        text: text.to_string(),
        from: envelope.get_metadata(META_FROM).map(str::to_string),
        to: envelope.get_metadata(META_TO).map(str::to_string),
    })
}
