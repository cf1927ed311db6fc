//! Conversation types held by the chat memory store.
//!
//! A [`Mode`] partitions conversations; each mode owns an ordered list of
//! [`Message`]s whose ids are unique within that mode.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::agent_api::ChatMessage;

/// Named conversational context. Any string is accepted; the assistant ships
/// with four built-in modes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Mode(String);

impl Mode {
    pub const GENERAL: &'static str = "general";
    pub const STUDENT: &'static str = "student";
    pub const CREATIVE: &'static str = "creative";
    pub const PRODUCTIVITY: &'static str = "productivity";

    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn general() -> Self {
        Self::new(Self::GENERAL)
    }

    pub fn student() -> Self {
        Self::new(Self::STUDENT)
    }

    pub fn creative() -> Self {
        Self::new(Self::CREATIVE)
    }

    pub fn productivity() -> Self {
        Self::new(Self::PRODUCTIVITY)
    }

    /// The built-in modes, in display order
    pub fn known() -> Vec<Mode> {
        vec![
            Self::general(),
            Self::student(),
            Self::creative(),
            Self::productivity(),
        ]
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Mode {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for Mode {
    fn from(name: String) -> Self {
        Self(name)
    }
}

/// Speaker of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// One turn of a conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub content: String,
    /// Creation time; not checked by the memory layer
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl Message {
    pub fn new(id: impl Into<String>, role: Role, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }

    /// User message with a fresh id
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Uuid::new_v4().to_string(), Role::User, content)
    }

    /// Assistant message with a fresh id
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Uuid::new_v4().to_string(), Role::Assistant, content)
    }

    /// Same id and same content. Role and timestamp are ignored.
    pub fn same_turn(&self, other: &Message) -> bool {
        self.id == other.id && self.content == other.content
    }
}

impl From<&Message> for ChatMessage {
    fn from(message: &Message) -> Self {
        ChatMessage {
            role: message.role.as_str().to_string(),
            content: message.content.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_serializes_as_plain_string() {
        let json = serde_json::to_string(&Mode::student()).unwrap();
        assert_eq!(json, "\"student\"");

        let mode: Mode = serde_json::from_str("\"homework\"").unwrap();
        assert_eq!(mode.as_str(), "homework");
    }

    #[test]
    fn test_message_timestamp_defaults_when_missing() {
        let msg: Message =
            serde_json::from_value(serde_json::json!({"id": "m1", "role": "user", "content": "hi"}))
                .unwrap();
        assert_eq!(msg.role, Role::User);
        assert!(msg.timestamp <= Utc::now());
    }

    #[test]
    fn test_unknown_role_rejected() {
        let parsed = serde_json::from_value::<Message>(
            serde_json::json!({"id": "m1", "role": "system", "content": "hi"}),
        );
        assert!(parsed.is_err());
    }

    #[test]
    fn test_same_turn_ignores_role_and_time() {
        let a = Message::new("m1", Role::User, "hello");
        let mut b = Message::new("m1", Role::Assistant, "hello");
        b.timestamp = a.timestamp - chrono::Duration::seconds(30);
        assert!(a.same_turn(&b));

        let c = Message::new("m1", Role::User, "hello!");
        assert!(!a.same_turn(&c));
    }

    #[test]
    fn test_generated_ids_are_unique() {
        assert_ne!(Message::user("a").id, Message::user("a").id);
    }

    #[test]
    fn test_into_api_message() {
        let api: ChatMessage = (&Message::assistant("done")).into();
        assert_eq!(api.role, "assistant");
        assert_eq!(api.content, "done");
    }
}
