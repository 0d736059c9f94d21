//! # agora-core
//!
//! The concurrency core of the Agora chat hub.
//!
//! - **Hub** - creates rooms on demand, tracks connected users and
//!   notification listeners, announces presence changes
//! - **Room** - one task per room serializing membership and fan-out
//! - **Connection** - inbound and outbound loops per transport
//! - **Presence** - reference-counted online state per username
//! - **Store** - the persistence gateway the hub consumes
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐ Forward ┌─────────────┐  offer  ┌─────────────┐
//! │  Connection │────────▶│    Room     │────────▶│  Connection │
//! │  (inbound)  │         │   (actor)   │         │  (outbound) │
//! └─────────────┘         └─────────────┘         └─────────────┘
//!        │                       │
//!        ▼                       ▼
//! ┌─────────────┐         ┌─────────────┐
//! │     Hub     │────────▶│  ChatStore  │
//! │ + Presence  │         └─────────────┘
//! └─────────────┘
//! ```

pub mod connection;
pub mod hub;
pub mod presence;
pub mod room;
pub mod store;

pub use connection::{ConnectionActor, ConnectionHandle, Identity, ANONYMOUS};
pub use hub::{
    derive_private_room_name, private_participants, Hub, HubConfig, HubError, HubStats,
    PRIVATE_ROOM_PREFIX,
};
pub use presence::{PresenceRegistry, PresenceTransition};
pub use room::RoomHandle;
pub use store::{format_timestamp, ChatMessage, ChatStore, MemoryStore, RecentChat, StoreError};
