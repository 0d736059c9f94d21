//! Event types for the Agora wire protocol.
//!
//! Chat events are decoded once, at the room boundary, into a closed set of
//! variants. Anything the hub does not recognise stays as raw bytes so it can
//! be fanned out unchanged.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Chat event kinds understood by the hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// A chat message.
    Message,
    /// The sender started typing.
    Typing,
    /// The sender stopped typing.
    StopTyping,
}

impl EventKind {
    /// The value carried in the `type` field.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            EventKind::Message => "message",
            EventKind::Typing => "typing",
            EventKind::StopTyping => "stop_typing",
        }
    }

    /// Parse a `type` field value.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "message" => Some(EventKind::Message),
            "typing" => Some(EventKind::Typing),
            "stop_typing" => Some(EventKind::StopTyping),
            _ => None,
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fields shared by every typed chat event.
///
/// `sender_id == 0` and an empty `created_at` mean "absent" and are omitted
/// when the payload is serialized again.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ChatPayload {
    /// Display name of the sender.
    pub name: String,
    /// Message body.
    pub message: String,
    /// Numeric id of the sender, stamped by the server.
    #[serde(skip_serializing_if = "is_zero")]
    pub sender_id: i64,
    /// Server-assigned creation time (RFC 3339).
    #[serde(skip_serializing_if = "String::is_empty")]
    pub created_at: String,
}

fn is_zero(value: &i64) -> bool {
    *value == 0
}

impl ChatPayload {
    /// Create a payload with a sender name and body.
    #[must_use]
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            ..Self::default()
        }
    }

    /// Set the sender id.
    #[must_use]
    pub fn with_sender_id(mut self, sender_id: i64) -> Self {
        self.sender_id = sender_id;
        self
    }

    /// Set the creation timestamp.
    #[must_use]
    pub fn with_created_at(mut self, created_at: impl Into<String>) -> Self {
        self.created_at = created_at.into();
        self
    }
}

/// A chat event as seen by a room.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatEvent {
    /// `type == "message"`.
    Message(ChatPayload),
    /// `type == "typing"`.
    Typing(ChatPayload),
    /// `type == "stop_typing"`.
    StopTyping(ChatPayload),
    /// Malformed or unrecognised payload, kept verbatim.
    Unknown(Bytes),
}

impl ChatEvent {
    /// Build a typed event from its kind and payload.
    #[must_use]
    pub fn typed(kind: EventKind, payload: ChatPayload) -> Self {
        match kind {
            EventKind::Message => ChatEvent::Message(payload),
            EventKind::Typing => ChatEvent::Typing(payload),
            EventKind::StopTyping => ChatEvent::StopTyping(payload),
        }
    }

    /// Get the event kind, `None` for unknown payloads.
    #[must_use]
    pub fn kind(&self) -> Option<EventKind> {
        match self {
            ChatEvent::Message(_) => Some(EventKind::Message),
            ChatEvent::Typing(_) => Some(EventKind::Typing),
            ChatEvent::StopTyping(_) => Some(EventKind::StopTyping),
            ChatEvent::Unknown(_) => None,
        }
    }

    /// Get the typed payload, if any.
    #[must_use]
    pub fn payload(&self) -> Option<&ChatPayload> {
        match self {
            ChatEvent::Message(p) | ChatEvent::Typing(p) | ChatEvent::StopTyping(p) => Some(p),
            ChatEvent::Unknown(_) => None,
        }
    }

    /// Check whether this is a chat message.
    #[must_use]
    pub fn is_message(&self) -> bool {
        matches!(self, ChatEvent::Message(_))
    }
}

/// System-wide presence notifications, broadcast to every room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PresenceEvent {
    /// A user's first connection opened.
    UserJoined { username: String },
    /// A user's last connection closed.
    UserLeft { username: String },
    /// Full roster of online users.
    UsersUpdate { users: Vec<String> },
}

impl PresenceEvent {
    /// Create a `user_joined` event.
    #[must_use]
    pub fn joined(username: impl Into<String>) -> Self {
        PresenceEvent::UserJoined {
            username: username.into(),
        }
    }

    /// Create a `user_left` event.
    #[must_use]
    pub fn left(username: impl Into<String>) -> Self {
        PresenceEvent::UserLeft {
            username: username.into(),
        }
    }

    /// Create a `users_update` event.
    #[must_use]
    pub fn roster(users: Vec<String>) -> Self {
        PresenceEvent::UsersUpdate { users }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_kind_parse() {
        assert_eq!(EventKind::parse("message"), Some(EventKind::Message));
        assert_eq!(EventKind::parse("stop_typing"), Some(EventKind::StopTyping));
        assert_eq!(EventKind::parse("user_joined"), None);
        assert_eq!(EventKind::Typing.to_string(), "typing");
    }

    #[test]
    fn test_payload_omits_absent_fields() {
        let json = serde_json::to_string(&ChatPayload::new("alice", "hi")).unwrap();
        assert_eq!(json, r#"{"name":"alice","message":"hi"}"#);

        let json = serde_json::to_string(
            &ChatPayload::new("alice", "hi")
                .with_sender_id(3)
                .with_created_at("2024-01-01T00:00:00.000Z"),
        )
        .unwrap();
        assert!(json.contains(r#""sender_id":3"#));
        assert!(json.contains(r#""created_at":"2024-01-01T00:00:00.000Z""#));
    }

    #[test]
    fn test_presence_event_serialize() {
        let json = serde_json::to_string(&PresenceEvent::joined("bob")).unwrap();
        assert_eq!(json, r#"{"type":"user_joined","username":"bob"}"#);

        let json = serde_json::to_string(&PresenceEvent::roster(vec!["a".into()])).unwrap();
        assert_eq!(json, r#"{"type":"users_update","users":["a"]}"#);
    }

    #[test]
    fn test_chat_event_accessors() {
        let event = ChatEvent::Typing(ChatPayload::new("alice", ""));
        assert_eq!(event.kind(), Some(EventKind::Typing));
        assert!(!event.is_message());
        assert_eq!(event.payload().map(|p| p.name.as_str()), Some("alice"));

        let unknown = ChatEvent::Unknown(Bytes::from_static(b"nope"));
        assert!(unknown.kind().is_none());
        assert!(unknown.payload().is_none());
    }
}
