//! # agora-protocol
//!
//! Wire payloads exchanged between Agora chat clients and the hub.
//!
//! Every frame on the wire is a JSON object with a `type` field. The hub only
//! understands a closed set of chat events; everything else is carried through
//! untouched so that clients can extend the protocol without server changes.
//!
//! ## Event Types
//!
//! - `message` - A chat message, persisted for private rooms
//! - `typing` / `stop_typing` - Ephemeral typing indicators
//! - `user_joined` / `user_left` / `users_update` - Presence notifications
//!
//! ## Example
//!
//! ```rust
//! use agora_protocol::{codec, ChatEvent};
//! use bytes::Bytes;
//!
//! let raw = Bytes::from_static(br#"{"type":"message","name":"alice","message":"hi"}"#);
//! let stamped = codec::stamp_inbound(&raw, 7);
//!
//! match codec::decode_event(&stamped) {
//!     ChatEvent::Message(payload) => assert_eq!(payload.sender_id, 7),
//!     other => panic!("unexpected event: {other:?}"),
//! }
//! ```

pub mod codec;
pub mod event;

pub use codec::{
    check_frame_size, decode_event, encode_event, encode_presence, stamp_inbound, ProtocolError,
    MAX_FRAME_SIZE,
};
pub use event::{ChatEvent, ChatPayload, EventKind, PresenceEvent};
