//! The chat hub.
//!
//! The hub is the single authority for room existence. It creates rooms on
//! first reference, keeps flat registries of connected users and
//! notification listeners, and turns presence transitions into persisted
//! flags and `user_joined` / `user_left` broadcasts.

use agora_protocol::{encode_presence, PresenceEvent};
use agora_transport::Connection;
use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::connection::{ConnectionActor, ConnectionHandle, Identity, ANONYMOUS};
use crate::presence::{PresenceRegistry, PresenceTransition};
use crate::room::{self, RoomContext, RoomHandle};
use crate::store::ChatStore;

/// Prefix shared by every private room name.
pub const PRIVATE_ROOM_PREFIX: &str = "private_";

/// Canonical name of the private room shared by two users.
///
/// The result does not depend on argument order.
///
/// ```
/// use agora_core::hub::derive_private_room_name;
///
/// assert_eq!(derive_private_room_name("bob", "alice"), "private_alice_bob");
/// assert_eq!(
///     derive_private_room_name("alice", "bob"),
///     derive_private_room_name("bob", "alice")
/// );
/// ```
#[must_use]
pub fn derive_private_room_name(user_a: &str, user_b: &str) -> String {
    let (first, second) = if user_a <= user_b {
        (user_a, user_b)
    } else {
        (user_b, user_a)
    };
    format!("{PRIVATE_ROOM_PREFIX}{first}_{second}")
}

/// The two participants encoded in a private room name.
///
/// Returns `None` for public rooms and for private names that do not split
/// into exactly two usernames.
#[must_use]
pub fn private_participants(room: &str) -> Option<(String, String)> {
    let rest = room.strip_prefix(PRIVATE_ROOM_PREFIX)?;
    let mut parts = rest.split('_');
    let first = parts.next()?;
    let second = parts.next()?;
    if parts.next().is_some() {
        return None;
    }
    Some((first.to_string(), second.to_string()))
}

/// Hub errors.
#[derive(Debug, Error)]
pub enum HubError {
    /// Invalid room name.
    #[error("Invalid room name: {0}")]
    InvalidRoomName(&'static str),

    /// A private chat needs both participants.
    #[error("Must specify room or both user1/user2")]
    MissingParticipants,

    /// The connecting user is not one of the private chat's participants.
    #[error("You can only join your own private chats")]
    NotParticipant,

    /// Notification listeners must identify themselves.
    #[error("Username required")]
    UsernameRequired,
}

/// Hub configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Capacity of each room's event mailbox.
    pub room_mailbox_capacity: usize,
    /// Capacity of each connection's outbound mailbox.
    pub outbound_capacity: usize,
    /// Maximum room name length in bytes.
    pub max_room_name_length: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            room_mailbox_capacity: 1024,
            outbound_capacity: 256,
            max_room_name_length: 256,
        }
    }
}

/// Hub statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HubStats {
    pub rooms: usize,
    pub connected_users: usize,
    pub notification_users: usize,
    pub online_users: usize,
}

/// Registry of rooms, connected users and presence.
pub struct Hub {
    config: HubConfig,
    store: Arc<dyn ChatStore>,
    rooms: DashMap<String, RoomHandle>,
    users: DashMap<String, ConnectionHandle>,
    listeners: Arc<DashMap<String, ConnectionHandle>>,
    presence: PresenceRegistry,
}

impl Hub {
    /// Create a hub with default configuration.
    #[must_use]
    pub fn new(store: Arc<dyn ChatStore>) -> Self {
        Self::with_config(store, HubConfig::default())
    }

    /// Create a hub with custom configuration.
    #[must_use]
    pub fn with_config(store: Arc<dyn ChatStore>, config: HubConfig) -> Self {
        info!("Creating hub with config: {:?}", config);
        Self {
            config,
            store,
            rooms: DashMap::new(),
            users: DashMap::new(),
            listeners: Arc::new(DashMap::new()),
            presence: PresenceRegistry::new(),
        }
    }

    /// Get the hub configuration.
    #[must_use]
    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// Get the persistence gateway.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn ChatStore> {
        &self.store
    }

    /// Get hub statistics.
    #[must_use]
    pub fn stats(&self) -> HubStats {
        HubStats {
            rooms: self.rooms.len(),
            connected_users: self.users.len(),
            notification_users: self.listeners.len(),
            online_users: self.presence.online_count(),
        }
    }

    /// Validate a public room name.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::InvalidRoomName`] for empty or overlong names and
    /// names containing control characters.
    pub fn validate_room_name(&self, name: &str) -> Result<(), HubError> {
        if name.is_empty() {
            return Err(HubError::InvalidRoomName("Room name cannot be empty"));
        }
        if name.len() > self.config.max_room_name_length {
            return Err(HubError::InvalidRoomName("Room name too long"));
        }
        if name.chars().any(char::is_control) {
            return Err(HubError::InvalidRoomName("Room name contains invalid characters"));
        }
        Ok(())
    }

    /// Check that `current` may open the private chat between `user1` and
    /// `user2`.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::MissingParticipants`] if either user is empty and
    /// [`HubError::NotParticipant`] if `current` is neither of them.
    pub fn authorize_private(user1: &str, user2: &str, current: &str) -> Result<(), HubError> {
        if user1.is_empty() || user2.is_empty() {
            return Err(HubError::MissingParticipants);
        }
        if current != user1 && current != user2 {
            return Err(HubError::NotParticipant);
        }
        Ok(())
    }

    /// Get the room called `name`, starting it if it does not exist yet.
    ///
    /// Concurrent callers always observe the same room.
    pub fn get_or_create_room(&self, name: &str) -> RoomHandle {
        match self.rooms.entry(name.to_string()) {
            Entry::Occupied(mut occupied) => {
                if !occupied.get().is_closed() {
                    return occupied.get().clone();
                }
                warn!(room = %name, "Room task stopped, restarting");
                let handle = self.spawn_room(name);
                occupied.insert(handle.clone());
                handle
            }
            Entry::Vacant(vacant) => {
                let handle = self.spawn_room(name);
                vacant.insert(handle.clone());
                handle
            }
        }
    }

    fn spawn_room(&self, name: &str) -> RoomHandle {
        let context = RoomContext {
            store: Arc::clone(&self.store),
            listeners: Arc::clone(&self.listeners),
        };
        room::spawn(name, self.config.room_mailbox_capacity, context)
    }

    /// Look up an existing room without creating it.
    #[must_use]
    pub fn room(&self, name: &str) -> Option<RoomHandle> {
        self.rooms.get(name).map(|r| r.clone())
    }

    /// Offer `payload` to every room's mailbox without waiting.
    ///
    /// Returns the number of rooms that accepted it.
    pub fn broadcast_to_all_rooms(&self, payload: &Bytes) -> usize {
        let mut accepted = 0;
        for room in self.rooms.iter() {
            if room.forward(payload.clone()) {
                accepted += 1;
            } else {
                debug!(room = %room.name(), "Room mailbox full, broadcast dropped");
            }
        }
        accepted
    }

    /// Offer the current online roster to every room.
    ///
    /// Nothing in the hub calls this; it is an extension hook for callers
    /// that want to resynchronise client rosters.
    pub fn broadcast_roster(&self) -> usize {
        let mut users = self.presence.snapshot();
        users.sort();
        self.announce(&PresenceEvent::roster(users))
    }

    fn announce(&self, event: &PresenceEvent) -> usize {
        match encode_presence(event) {
            Ok(payload) => self.broadcast_to_all_rooms(&payload),
            Err(e) => {
                warn!(error = %e, "Failed to encode presence event");
                0
            }
        }
    }

    /// Current online usernames, in no particular order.
    #[must_use]
    pub fn online_users(&self) -> Vec<String> {
        self.presence.snapshot()
    }

    /// Current online usernames other than `name`.
    #[must_use]
    pub fn online_users_except(&self, name: &str) -> Vec<String> {
        self.presence
            .snapshot()
            .into_iter()
            .filter(|u| u != name)
            .collect()
    }

    /// Check whether a user is online.
    #[must_use]
    pub fn is_online(&self, username: &str) -> bool {
        self.presence.is_online(username)
    }

    /// Number of open connections held by a user.
    #[must_use]
    pub fn connection_count(&self, username: &str) -> usize {
        self.presence.connection_count(username)
    }

    /// Restore presence at startup.
    ///
    /// Clears every persisted online flag first and only then seeds the
    /// registry from the store, so flags left behind by an unclean shutdown
    /// do not show up as online users.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be reset or read.
    pub async fn load_presence(&self) -> Result<usize, crate::store::StoreError> {
        self.store.reset_all_offline().await?;
        let online = self.store.list_online_usernames().await?;
        let seeded = self.presence.seed(online);
        info!(seeded, "Presence loaded");
        Ok(seeded)
    }

    /// Serve a member of the public room `name` until it disconnects.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::InvalidRoomName`] before touching the transport if
    /// the name is rejected.
    pub async fn join_room(
        &self,
        name: &str,
        conn: Box<dyn Connection>,
        identity: Identity,
    ) -> Result<(), HubError> {
        self.validate_room_name(name)?;
        let room = self.get_or_create_room(name);
        self.serve_member(&room, conn, identity).await;
        Ok(())
    }

    /// Serve a participant of the private chat between `user1` and `user2`
    /// until it disconnects.
    ///
    /// # Errors
    ///
    /// Returns the [`Hub::authorize_private`] errors.
    pub async fn join_private(
        &self,
        user1: &str,
        user2: &str,
        conn: Box<dyn Connection>,
        identity: Identity,
    ) -> Result<(), HubError> {
        Self::authorize_private(user1, user2, identity.name())?;
        let room = self.get_or_create_room(&derive_private_room_name(user1, user2));
        self.serve_member(&room, conn, identity).await;
        Ok(())
    }

    /// Serve a notification listener until it disconnects.
    ///
    /// Listeners belong to no room; they receive private messages addressed
    /// to them while they are not in the conversation.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::UsernameRequired`] for an anonymous listener.
    pub async fn join_notifications(
        &self,
        conn: Box<dyn Connection>,
        identity: Identity,
    ) -> Result<(), HubError> {
        if identity.name().is_empty() || identity.name() == ANONYMOUS {
            return Err(HubError::UsernameRequired);
        }

        let actor = ConnectionActor::new(conn, identity, self.config.outbound_capacity);
        let handle = actor.handle().clone();
        debug!(connection = %handle.id(), user = %handle.name(), "Notification listener connected");

        self.listeners
            .insert(handle.name().to_string(), handle.clone());
        self.connection_opened(handle.name()).await;

        actor.run(None).await;

        self.listeners
            .remove_if(handle.name(), |_, current| current.id() == handle.id());
        self.connection_closed(handle.name()).await;
        Ok(())
    }

    async fn serve_member(&self, room: &RoomHandle, conn: Box<dyn Connection>, identity: Identity) {
        let actor = ConnectionActor::new(conn, identity, self.config.outbound_capacity);
        let handle = actor.handle().clone();

        if !room.join(handle.clone()).await {
            warn!(room = %room.name(), connection = %handle.id(), "Room is not running");
            actor.reject().await;
            return;
        }
        self.users.insert(handle.name().to_string(), handle.clone());
        self.connection_opened(handle.name()).await;

        actor.run(Some(room)).await;

        self.users
            .remove_if(handle.name(), |_, current| current.id() == handle.id());
        self.connection_closed(handle.name()).await;
    }

    async fn connection_opened(&self, username: &str) {
        if self.presence.connection_opened(username) == Some(PresenceTransition::CameOnline) {
            self.persist_presence(username, true).await;
            self.announce(&PresenceEvent::joined(username));
        }
    }

    async fn connection_closed(&self, username: &str) {
        if self.presence.connection_closed(username) == Some(PresenceTransition::WentOffline) {
            self.persist_presence(username, false).await;
            self.announce(&PresenceEvent::left(username));
        }
    }

    async fn persist_presence(&self, username: &str, online: bool) {
        let user_id = match self.store.resolve_user_id(username).await {
            Ok(id) => id,
            Err(e) => {
                debug!(user = %username, error = %e, "Presence not persisted");
                return;
            }
        };
        let result = if online {
            self.store.set_online(user_id).await
        } else {
            self.store.set_offline(user_id).await
        };
        if let Err(e) = result {
            warn!(user = %username, online, error = %e, "Failed to persist presence");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use agora_transport::memory::{self, MemoryPeer};
    use std::time::Duration;

    async fn eventually(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    async fn members(hub: &Hub, room: &str, expected: usize) {
        for _ in 0..200 {
            if let Some(handle) = hub.room(room) {
                if handle.snapshot().await.map_or(0, |m| m.len()) == expected {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("room {room} never reached {expected} members");
    }

    fn connect_private(hub: &Arc<Hub>, name: &str, user_id: i64, other: &str) -> MemoryPeer {
        let (conn, peer) = memory::pair();
        let hub = Arc::clone(hub);
        let (name, other) = (name.to_string(), other.to_string());
        tokio::spawn(async move {
            let identity = Identity::new(name.clone(), user_id);
            hub.join_private(&name, &other, Box::new(conn), identity)
                .await
                .unwrap();
        });
        peer
    }

    fn connect_public(hub: &Arc<Hub>, room: &str, name: &str) -> MemoryPeer {
        let (conn, peer) = memory::pair();
        let hub = Arc::clone(hub);
        let (room, name) = (room.to_string(), name.to_string());
        tokio::spawn(async move {
            hub.join_room(&room, Box::new(conn), Identity::new(name, 0))
                .await
                .unwrap();
        });
        peer
    }

    async fn next_of_type(peer: &mut MemoryPeer, kind: &str) -> serde_json::Value {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(2), peer.recv())
                .await
                .expect("timed out")
                .expect("connection closed");
            let value: serde_json::Value = serde_json::from_slice(&frame).unwrap();
            if value["type"] == kind {
                return value;
            }
        }
    }

    fn drained_types(peer: &mut MemoryPeer) -> Vec<String> {
        let mut kinds = Vec::new();
        while let Some(frame) = peer.try_recv() {
            let value: serde_json::Value =
                serde_json::from_slice(&frame).unwrap_or(serde_json::Value::Null);
            kinds.push(value["type"].as_str().unwrap_or_default().to_string());
        }
        kinds
    }

    #[test]
    fn test_private_room_name() {
        assert_eq!(derive_private_room_name("alice", "bob"), "private_alice_bob");
        assert_eq!(
            derive_private_room_name("zoe", "adam"),
            derive_private_room_name("adam", "zoe")
        );
        assert_eq!(
            private_participants("private_alice_bob"),
            Some(("alice".to_string(), "bob".to_string()))
        );
        assert_eq!(private_participants("lobby"), None);
        assert_eq!(private_participants("private_a_b_c"), None);
        assert_eq!(private_participants("private_alice"), None);
    }

    #[test]
    fn test_authorize_private() {
        assert!(Hub::authorize_private("alice", "bob", "bob").is_ok());
        assert!(matches!(
            Hub::authorize_private("alice", "", "alice"),
            Err(HubError::MissingParticipants)
        ));
        assert!(matches!(
            Hub::authorize_private("alice", "bob", "mallory"),
            Err(HubError::NotParticipant)
        ));
    }

    #[tokio::test]
    async fn test_room_name_validation() {
        let hub = Hub::new(Arc::new(MemoryStore::new()));
        assert!(hub.validate_room_name("general").is_ok());
        assert!(hub.validate_room_name("").is_err());
        assert!(hub.validate_room_name("bad\nname").is_err());
        assert!(hub.validate_room_name(&"a".repeat(257)).is_err());

        let (conn, _peer) = memory::pair();
        let result = hub
            .join_room("", Box::new(conn), Identity::new("alice", 0))
            .await;
        assert!(matches!(result, Err(HubError::InvalidRoomName(_))));
        assert_eq!(hub.stats().rooms, 0);
    }

    #[tokio::test]
    async fn test_get_or_create_room_is_unique() {
        let hub = Arc::new(Hub::new(Arc::new(MemoryStore::new())));

        let tasks: Vec<_> = (0..32)
            .map(|_| {
                let hub = Arc::clone(&hub);
                tokio::spawn(async move { hub.get_or_create_room("general") })
            })
            .collect();

        let mut handles = Vec::new();
        for task in tasks {
            handles.push(task.await.unwrap());
        }

        assert_eq!(hub.stats().rooms, 1);
        let (conn, _rx) = ConnectionHandle::channel("c1".into(), Identity::new("alice", 0), 4);
        handles[0].join(conn).await;
        for handle in &handles {
            assert_eq!(handle.snapshot().await.unwrap(), ["alice"]);
        }
    }

    #[tokio::test]
    async fn test_private_chat_end_to_end() {
        let store = Arc::new(MemoryStore::new());
        let alice_id = store.add_user("alice").await;
        let bob_id = store.add_user("bob").await;
        let hub = Arc::new(Hub::new(store.clone()));
        let room = derive_private_room_name("alice", "bob");

        let mut alice = connect_private(&hub, "alice", alice_id, "bob");
        members(&hub, &room, 1).await;
        let mut bob = connect_private(&hub, "bob", bob_id, "alice");
        members(&hub, &room, 2).await;

        alice
            .send(r#"{"type":"message","name":"alice","message":"hi","created_at":"forged"}"#)
            .unwrap();

        let received = next_of_type(&mut bob, "message").await;
        assert_eq!(received["name"], "alice");
        assert_eq!(received["message"], "hi");
        assert_eq!(received["sender_id"], alice_id);

        let saved = store.fetch_messages(alice_id, bob_id, 1, 0).await.unwrap();
        assert_eq!(saved.len(), 1);
        assert_ne!(received["created_at"], "forged");
        assert_eq!(received["created_at"], saved[0].created_at.as_str());

        hub.room(&room).unwrap().snapshot().await.unwrap();
        assert!(!drained_types(&mut alice).contains(&"message".to_string()));
    }

    #[tokio::test]
    async fn test_message_reaches_receivers_notification_listener() {
        let store = Arc::new(MemoryStore::new());
        let alice_id = store.add_user("alice").await;
        store.add_user("bob").await;
        let hub = Arc::new(Hub::new(store.clone()));

        let (conn, mut bob_listener) = memory::pair();
        let listener_hub = Arc::clone(&hub);
        tokio::spawn(async move {
            let identity = Identity::listener("bob", 0).unwrap();
            listener_hub
                .join_notifications(Box::new(conn), identity)
                .await
                .unwrap();
        });
        eventually(|| hub.stats().notification_users == 1).await;

        let alice = connect_private(&hub, "alice", alice_id, "bob");
        members(&hub, &derive_private_room_name("alice", "bob"), 1).await;
        alice
            .send(r#"{"type":"message","name":"alice","message":"ping"}"#)
            .unwrap();

        let notified = next_of_type(&mut bob_listener, "message").await;
        assert_eq!(notified["message"], "ping");
        assert!(!notified["created_at"].as_str().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_anonymous_listener_is_rejected() {
        let hub = Hub::new(Arc::new(MemoryStore::new()));
        let (conn, _peer) = memory::pair();

        let result = hub
            .join_notifications(Box::new(conn), Identity::new("", 0))
            .await;
        assert!(matches!(result, Err(HubError::UsernameRequired)));
        assert_eq!(hub.stats().notification_users, 0);
        assert!(!hub.is_online(ANONYMOUS));
    }

    #[tokio::test]
    async fn test_failed_join_does_not_count_presence() {
        let store = Arc::new(MemoryStore::new());
        store.add_user("alice").await;
        let hub = Hub::new(store.clone());
        let stopped = room::stopped("general");
        let (conn, peer) = memory::pair();

        hub.serve_member(&stopped, Box::new(conn), Identity::new("alice", 0))
            .await;

        assert!(peer.is_closed());
        assert!(!hub.is_online("alice"));
        assert_eq!(hub.stats().connected_users, 0);
        assert!(store.list_online_usernames().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_presence_with_two_connections() {
        let store = Arc::new(MemoryStore::new());
        store.add_user("alice").await;
        let hub = Arc::new(Hub::new(store.clone()));

        let mut first = connect_public(&hub, "general", "alice");
        eventually(|| hub.is_online("alice")).await;
        let mut second = connect_public(&hub, "general", "alice");
        eventually(|| hub.connection_count("alice") == 2).await;
        assert_eq!(store.list_online_usernames().await.unwrap(), ["alice"]);

        first.hang_up();
        eventually(|| hub.connection_count("alice") == 1).await;
        assert!(hub.is_online("alice"));
        assert_eq!(hub.stats().connected_users, 1);

        second.hang_up();
        eventually(|| !hub.is_online("alice")).await;
        assert_eq!(hub.stats().connected_users, 0);
        eventually(|| first.is_closed() && second.is_closed()).await;
        assert!(store.list_online_usernames().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_presence_changes_are_broadcast_to_rooms() {
        let hub = Arc::new(Hub::new(Arc::new(MemoryStore::new())));

        let mut watcher = connect_public(&hub, "general", "watcher");
        members(&hub, "general", 1).await;
        let own = next_of_type(&mut watcher, "user_joined").await;
        assert_eq!(own["username"], "watcher");

        let mut bob = connect_public(&hub, "random", "bob");
        let joined = next_of_type(&mut watcher, "user_joined").await;
        assert_eq!(joined["username"], "bob");

        assert!(hub.broadcast_roster() >= 1);
        let roster = next_of_type(&mut watcher, "users_update").await;
        assert_eq!(roster["users"], serde_json::json!(["bob", "watcher"]));

        bob.hang_up();
        let left = next_of_type(&mut watcher, "user_left").await;
        assert_eq!(left["username"], "bob");
        assert!(hub.online_users_except("watcher").is_empty());
        assert_eq!(hub.online_users(), ["watcher"]);
    }

    #[tokio::test]
    async fn test_load_presence_resets_before_seeding() {
        let store = Arc::new(MemoryStore::new());
        let alice = store.add_user("alice").await;
        store.set_online(alice).await.unwrap();

        let hub = Hub::new(store.clone());
        assert_eq!(hub.load_presence().await.unwrap(), 0);
        assert!(hub.online_users().is_empty());
        assert!(store.list_online_usernames().await.unwrap().is_empty());
    }
}
