//! JSON codec for Agora frames.
//!
//! Decoding never fails: a frame that is not a recognised chat event becomes
//! [`ChatEvent::Unknown`] carrying the original bytes.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::event::{ChatEvent, ChatPayload, EventKind, PresenceEvent};

/// Default maximum frame size (64 KiB).
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

/// Protocol errors that can occur during encoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds the allowed size.
    #[error("Frame size {size} exceeds maximum {max}")]
    FrameTooLarge { size: usize, max: usize },

    /// JSON encoding error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Loose view of an incoming event; every field is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WireEvent {
    #[serde(rename = "type")]
    kind: Option<String>,
    name: Option<String>,
    message: Option<String>,
    sender_id: Option<i64>,
    created_at: Option<String>,
}

#[derive(Serialize)]
struct WireOut<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    #[serde(flatten)]
    payload: &'a ChatPayload,
}

/// Check a frame length against a maximum.
///
/// # Errors
///
/// Returns [`ProtocolError::FrameTooLarge`] if `size > max`.
pub fn check_frame_size(size: usize, max: usize) -> Result<(), ProtocolError> {
    if size > max {
        return Err(ProtocolError::FrameTooLarge { size, max });
    }
    Ok(())
}

fn is_json_object(raw: &[u8]) -> bool {
    raw.iter().find(|b| !b.is_ascii_whitespace()) == Some(&b'{')
}

/// Decode a raw frame into a chat event.
#[must_use]
pub fn decode_event(raw: &Bytes) -> ChatEvent {
    if !is_json_object(raw) {
        return ChatEvent::Unknown(raw.clone());
    }

    let Ok(wire) = serde_json::from_slice::<WireEvent>(raw) else {
        return ChatEvent::Unknown(raw.clone());
    };

    let Some(kind) = wire.kind.as_deref().and_then(EventKind::parse) else {
        return ChatEvent::Unknown(raw.clone());
    };

    let payload = ChatPayload {
        name: wire.name.unwrap_or_default(),
        message: wire.message.unwrap_or_default(),
        sender_id: wire.sender_id.unwrap_or_default(),
        created_at: wire.created_at.unwrap_or_default(),
    };

    ChatEvent::typed(kind, payload)
}

/// Encode a chat event.
///
/// Typed events are re-serialized from their fields; unknown events are
/// returned as their original bytes.
///
/// # Errors
///
/// Returns an error if JSON serialization fails.
pub fn encode_event(event: &ChatEvent) -> Result<Bytes, ProtocolError> {
    let (kind, payload) = match event {
        ChatEvent::Unknown(raw) => return Ok(raw.clone()),
        ChatEvent::Message(p) => (EventKind::Message, p),
        ChatEvent::Typing(p) => (EventKind::Typing, p),
        ChatEvent::StopTyping(p) => (EventKind::StopTyping, p),
    };

    let out = WireOut {
        kind: kind.as_str(),
        payload,
    };
    Ok(Bytes::from(serde_json::to_vec(&out)?))
}

/// Encode a presence notification.
///
/// # Errors
///
/// Returns an error if JSON serialization fails.
pub fn encode_presence(event: &PresenceEvent) -> Result<Bytes, ProtocolError> {
    Ok(Bytes::from(serde_json::to_vec(event)?))
}

/// Stamp an inbound client frame before it enters a room.
///
/// A JSON object gets `sender_id` overwritten with the connection's resolved
/// id and `created_at` cleared. Anything else is returned unmodified.
#[must_use]
pub fn stamp_inbound(raw: &Bytes, sender_id: i64) -> Bytes {
    let Ok(mut fields) = serde_json::from_slice::<Map<String, Value>>(raw) else {
        return raw.clone();
    };

    fields.insert("sender_id".to_string(), Value::from(sender_id));
    fields.insert("created_at".to_string(), Value::String(String::new()));

    match serde_json::to_vec(&fields) {
        Ok(data) => Bytes::from(data),
        Err(_) => raw.clone(),
    }
}
