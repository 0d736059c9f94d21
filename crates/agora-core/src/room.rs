//! Room actors.
//!
//! A room owns the membership of one named channel. All membership changes
//! and chat traffic for the room pass through its mailbox and are handled
//! one at a time by a single task, so the member set needs no locking.
//!
//! Private rooms (see [`crate::hub::derive_private_room_name`]) additionally
//! persist chat messages and bridge them to the receiver's notification
//! listener.

use agora_protocol::{decode_event, encode_event, ChatEvent, ChatPayload};
use agora_transport::ConnectionId;
use bytes::Bytes;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};

use crate::connection::ConnectionHandle;
use crate::hub::private_participants;
use crate::store::ChatStore;

/// Events processed by a room, in arrival order.
#[derive(Debug)]
pub(crate) enum RoomEvent {
    Join(ConnectionHandle),
    Leave(ConnectionId),
    Forward(Bytes),
    Snapshot(oneshot::Sender<Vec<String>>),
}

/// Cloneable handle to a running room.
#[derive(Debug, Clone)]
pub struct RoomHandle {
    name: Arc<str>,
    mailbox: mpsc::Sender<RoomEvent>,
}

impl RoomHandle {
    /// Get the room name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Add a connection to the room.
    ///
    /// Waits for mailbox capacity. Returns `false` if the room has stopped.
    pub async fn join(&self, conn: ConnectionHandle) -> bool {
        self.mailbox.send(RoomEvent::Join(conn)).await.is_ok()
    }

    /// Remove a connection from the room and close its outbound mailbox.
    ///
    /// Waits for mailbox capacity. Returns `false` if the room has stopped.
    pub async fn leave(&self, id: &ConnectionId) -> bool {
        self.mailbox.send(RoomEvent::Leave(id.clone())).await.is_ok()
    }

    /// Offer a payload for fan-out without waiting.
    ///
    /// Returns `false` if the mailbox is full or the room has stopped.
    pub fn forward(&self, payload: Bytes) -> bool {
        self.mailbox.try_send(RoomEvent::Forward(payload)).is_ok()
    }

    /// Display names of the current members, in no particular order.
    ///
    /// The query is queued behind every event already in the mailbox.
    pub async fn snapshot(&self) -> Option<Vec<String>> {
        let (tx, rx) = oneshot::channel();
        self.mailbox.send(RoomEvent::Snapshot(tx)).await.ok()?;
        rx.await.ok()
    }

    /// Check whether the room task has stopped.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.mailbox.is_closed()
    }
}

/// Collaborators a room needs beyond its own state.
#[derive(Clone)]
pub(crate) struct RoomContext {
    pub store: Arc<dyn ChatStore>,
    pub listeners: Arc<DashMap<String, ConnectionHandle>>,
}

struct Room {
    name: Arc<str>,
    participants: Option<(String, String)>,
    members: HashMap<ConnectionId, ConnectionHandle>,
    context: RoomContext,
}

/// Start a room task and return its handle.
pub(crate) fn spawn(name: &str, capacity: usize, context: RoomContext) -> RoomHandle {
    let name: Arc<str> = Arc::from(name);
    let (tx, rx) = mpsc::channel(capacity.max(1));

    let room = Room {
        participants: private_participants(&name),
        name: Arc::clone(&name),
        members: HashMap::new(),
        context,
    };
    tokio::spawn(room.run(rx));

    RoomHandle { name, mailbox: tx }
}

/// Handle to a room whose task has already stopped.
#[cfg(test)]
pub(crate) fn stopped(name: &str) -> RoomHandle {
    let (tx, _) = mpsc::channel(1);
    RoomHandle {
        name: Arc::from(name),
        mailbox: tx,
    }
}

impl Room {
    async fn run(mut self, mut mailbox: mpsc::Receiver<RoomEvent>) {
        info!(room = %self.name, private = self.participants.is_some(), "Room started");

        while let Some(event) = mailbox.recv().await {
            match event {
                RoomEvent::Join(conn) => self.join(conn),
                RoomEvent::Leave(id) => self.leave(&id),
                RoomEvent::Forward(payload) => self.forward(payload).await,
                RoomEvent::Snapshot(reply) => {
                    let names = self.members.values().map(|m| m.name().to_string()).collect();
                    let _ = reply.send(names);
                }
            }
        }

        debug!(room = %self.name, "Room stopped");
    }

    fn join(&mut self, conn: ConnectionHandle) {
        let id = conn.id().clone();
        if self.members.contains_key(&id) {
            return;
        }
        debug!(room = %self.name, connection = %id, user = %conn.name(), "Member joined");
        self.members.insert(id, conn);
        trace!(room = %self.name, members = self.members.len(), "Membership changed");
    }

    fn leave(&mut self, id: &ConnectionId) {
        if let Some(conn) = self.members.remove(id) {
            conn.close();
            debug!(room = %self.name, connection = %id, user = %conn.name(), "Member left");
        }
    }

    async fn forward(&mut self, raw: Bytes) {
        let event = decode_event(&raw);

        let outgoing = match (&event, &self.participants) {
            (ChatEvent::Message(payload), Some((first, second))) => {
                self.persist(payload, raw, first, second).await
            }
            _ => raw,
        };

        // Only chat messages skip their sender; typing indicators and
        // anything unrecognised reach every member.
        let sender = event
            .is_message()
            .then(|| event.payload().map(|p| p.name.as_str()))
            .flatten();
        trace!(room = %self.name, kind = ?event.kind(), "Forwarding event");
        self.fan_out(&outgoing, sender);
    }

    /// Persist a private message and bridge it to the receiver's listener.
    ///
    /// Returns the payload to fan out: re-encoded with the stored timestamp
    /// when the message was saved and read back, otherwise `raw`.
    async fn persist(&self, payload: &ChatPayload, raw: Bytes, first: &str, second: &str) -> Bytes {
        let sender_id = if payload.sender_id > 0 {
            payload.sender_id
        } else {
            self.resolve(&payload.name).await
        };
        let receiver = if first == payload.name { second } else { first };
        let receiver_id = self.resolve(receiver).await;

        if sender_id <= 0 || receiver_id <= 0 {
            debug!(
                room = %self.name,
                sender_id,
                receiver_id,
                "Participants unresolved, message not persisted"
            );
            return raw;
        }

        let store = &self.context.store;
        if let Err(e) = store.save_message(sender_id, receiver_id, &payload.message).await {
            warn!(room = %self.name, error = %e, "Failed to persist message");
            return raw;
        }

        let outgoing = match store.fetch_messages(sender_id, receiver_id, 1, 0).await {
            Ok(saved) => match saved.into_iter().next() {
                Some(saved) => {
                    let stamped = ChatEvent::Message(
                        payload
                            .clone()
                            .with_sender_id(sender_id)
                            .with_created_at(saved.created_at),
                    );
                    match encode_event(&stamped) {
                        Ok(bytes) => bytes,
                        Err(e) => {
                            warn!(room = %self.name, error = %e, "Failed to re-encode message");
                            raw
                        }
                    }
                }
                None => raw,
            },
            Err(e) => {
                warn!(room = %self.name, error = %e, "Failed to read back message");
                raw
            }
        };

        if let Some(listener) = self.context.listeners.get(receiver) {
            if listener.offer(outgoing.clone()) {
                trace!(room = %self.name, user = %receiver, "Notified listener");
            }
        }

        outgoing
    }

    async fn resolve(&self, username: &str) -> i64 {
        match self.context.store.resolve_user_id(username).await {
            Ok(id) => id,
            Err(e) => {
                debug!(room = %self.name, user = %username, error = %e, "Failed to resolve user");
                0
            }
        }
    }

    fn fan_out(&self, frame: &Bytes, sender: Option<&str>) {
        let mut delivered = 0usize;
        for member in self.members.values() {
            if sender.is_some_and(|name| member.name() == name) {
                continue;
            }
            if member.offer(frame.clone()) {
                delivered += 1;
            }
        }
        trace!(room = %self.name, delivered, members = self.members.len(), "Fanned out");
    }
}
