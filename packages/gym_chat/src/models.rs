//! Chat message and conversation records, plus their JSON wire shapes.
//!
//! Inbound payloads are decoded strictly: a frame missing any field is
//! rejected as a whole. Outbound payloads carry only `roomId`, `senderId`
//! and `content`; the server assigns `id` and `createdAt`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::DecodeError;

/// A chat message. `id` and `created_at` are present only once the server
/// has persisted it; `room_id` is absent on drafts that rely on the joined room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: Option<String>,
    pub room_id: Option<String>,
    pub sender_id: String,
    pub content: String,
    pub created_at: Option<DateTime<Utc>>,
}

impl Message {
    /// A local draft with no room, id or timestamp.
    pub fn draft(sender_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: None,
            room_id: None,
            sender_id: sender_id.into(),
            content: content.into(),
            created_at: None,
        }
    }

    pub fn in_room(mut self, room_id: impl Into<String>) -> Self {
        self.room_id = Some(room_id.into());
        self
    }

    pub fn is_persisted(&self) -> bool {
        self.id.is_some() && self.created_at.is_some()
    }

    /// Decode one inbound JSON frame. Every field must be present and the
    /// identifiers non-empty.
    pub fn decode(frame: &str) -> Result<Self, DecodeError> {
        let wire: InboundMessage = serde_json::from_str(frame)?;
        wire.try_into()
    }

    /// Decode an inbound binary frame carrying UTF-8 JSON.
    pub fn decode_bytes(frame: &[u8]) -> Result<Self, DecodeError> {
        let text = std::str::from_utf8(frame).map_err(|_| DecodeError::NotUtf8)?;
        Self::decode(text)
    }

    pub(crate) fn decode_value(value: serde_json::Value) -> Result<Self, DecodeError> {
        let wire: InboundMessage = serde_json::from_value(value)?;
        wire.try_into()
    }
}

/// Strict inbound shape. No field has a default.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InboundMessage {
    #[serde(deserialize_with = "opaque_id")]
    id: String,
    #[serde(deserialize_with = "opaque_id")]
    room_id: String,
    #[serde(deserialize_with = "opaque_id")]
    sender_id: String,
    content: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<InboundMessage> for Message {
    type Error = DecodeError;

    fn try_from(wire: InboundMessage) -> Result<Self, Self::Error> {
        if wire.id.is_empty() {
            return Err(DecodeError::EmptyField("id"));
        }
        if wire.room_id.is_empty() {
            return Err(DecodeError::EmptyField("roomId"));
        }
        if wire.sender_id.is_empty() {
            return Err(DecodeError::EmptyField("senderId"));
        }
        Ok(Message {
            id: Some(wire.id),
            room_id: Some(wire.room_id),
            sender_id: wire.sender_id,
            content: wire.content,
            created_at: Some(wire.created_at),
        })
    }
}

/// Identifiers arrive as strings or integers depending on the backend model.
fn opaque_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Id {
        Text(String),
        Number(serde_json::Number),
    }

    Ok(match Id::deserialize(deserializer)? {
        Id::Text(s) => s,
        Id::Number(n) => n.to_string(),
    })
}

/// Outbound payload: `{roomId, senderId, content}` and nothing else.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct OutboundMessage<'a> {
    pub room_id: &'a str,
    pub sender_id: &'a str,
    pub content: &'a str,
}

impl<'a> OutboundMessage<'a> {
    pub fn new(room_id: &'a str, message: &'a Message) -> Self {
        Self {
            room_id,
            sender_id: &message.sender_id,
            content: &message.content,
        }
    }
}

/// A conversation as returned by the history API. The shape is owned by the
/// server; only the room identifier is interpreted here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Conversation(serde_json::Value);

impl Conversation {
    pub fn new(value: serde_json::Value) -> Self {
        Self(value)
    }

    /// The room this conversation belongs to, read from `roomId`, `room_id`
    /// or `id` in that order.
    pub fn room_id(&self) -> Option<String> {
        ["roomId", "room_id", "id"]
            .iter()
            .filter_map(|key| self.0.get(key))
            .find_map(|v| match v {
                serde_json::Value::String(s) if !s.is_empty() => Some(s.clone()),
                serde_json::Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
    }

    pub fn as_json(&self) -> &serde_json::Value {
        &self.0
    }

    pub fn into_json(self) -> serde_json::Value {
        self.0
    }
}
