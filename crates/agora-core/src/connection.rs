//! Connection actors.
//!
//! Each accepted transport becomes a [`ConnectionActor`] with two loops:
//!
//! - **inbound**: reads frames, stamps them with the connection's user id
//!   and offers them to the attached room
//! - **outbound**: drains the connection's bounded mailbox onto the transport
//!
//! Everything else in the hub talks to a connection through its cloneable
//! [`ConnectionHandle`].

use agora_protocol::stamp_inbound;
use agora_transport::{Connection, ConnectionId, FrameReader, FrameWriter};
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, trace, warn};

use crate::hub::HubError;
use crate::room::RoomHandle;

/// Display name used when a client does not identify itself.
pub const ANONYMOUS: &str = "Anonymous";

/// Who is on the other end of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    name: String,
    user_id: i64,
}

impl Identity {
    /// Build an identity for a room member. An empty name becomes
    /// [`ANONYMOUS`]; `user_id` is 0 when the session did not resolve.
    #[must_use]
    pub fn new(name: impl Into<String>, user_id: i64) -> Self {
        let name = name.into();
        let name = if name.is_empty() {
            ANONYMOUS.to_string()
        } else {
            name
        };
        Self { name, user_id }
    }

    /// Build an identity for a notification listener.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::UsernameRequired`] if `name` is empty.
    pub fn listener(name: impl Into<String>, user_id: i64) -> Result<Self, HubError> {
        let name = name.into();
        if name.is_empty() {
            return Err(HubError::UsernameRequired);
        }
        Ok(Self { name, user_id })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn user_id(&self) -> i64 {
        self.user_id
    }
}

/// Cloneable handle to a live connection's outbound mailbox.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    identity: Arc<Identity>,
    outbox: mpsc::Sender<Bytes>,
    closed: Arc<Notify>,
}

impl ConnectionHandle {
    /// Create a handle and the mailbox it feeds.
    pub(crate) fn channel(
        id: ConnectionId,
        identity: Identity,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<Bytes>) {
        let (outbox, rx) = mpsc::channel(capacity.max(1));
        let handle = Self {
            id,
            identity: Arc::new(identity),
            outbox,
            closed: Arc::new(Notify::new()),
        };
        (handle, rx)
    }

    #[must_use]
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        self.identity.name()
    }

    #[must_use]
    pub fn user_id(&self) -> i64 {
        self.identity.user_id()
    }

    /// Offer a frame without waiting.
    ///
    /// Returns `false` if the mailbox is full or already closed; the frame is
    /// dropped for this connection only.
    pub fn offer(&self, frame: Bytes) -> bool {
        match self.outbox.try_send(frame) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!(connection = %self.id, user = %self.name(), "Outbound mailbox full, frame dropped");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Close the outbound mailbox. Frames already queued are still written.
    pub fn close(&self) {
        self.closed.notify_one();
    }
}

/// One accepted transport, ready to run.
pub struct ConnectionActor {
    handle: ConnectionHandle,
    reader: Box<dyn FrameReader>,
    writer: Box<dyn FrameWriter>,
    outbox: mpsc::Receiver<Bytes>,
}

impl ConnectionActor {
    /// Wrap a transport. `capacity` bounds the outbound mailbox.
    #[must_use]
    pub fn new(conn: Box<dyn Connection>, identity: Identity, capacity: usize) -> Self {
        let id = conn.id().clone();
        let (handle, outbox) = ConnectionHandle::channel(id, identity, capacity);
        let (reader, writer) = conn.split();
        Self {
            handle,
            reader,
            writer,
            outbox,
        }
    }

    #[must_use]
    pub fn handle(&self) -> &ConnectionHandle {
        &self.handle
    }

    /// Close the transport without serving it.
    pub async fn reject(self) {
        let Self {
            handle, mut writer, ..
        } = self;
        if let Err(e) = writer.close().await {
            debug!(connection = %handle.id(), error = %e, "Close failed");
        }
    }

    /// Run both loops until the connection is finished.
    ///
    /// The actor is finished when the inbound loop ends (peer closed or the
    /// transport failed) or the outbound loop fails to write. Either way the
    /// connection leaves `room` and the outbound loop is drained and joined
    /// before this returns. Without a room (notification listeners) the actor
    /// closes its own mailbox.
    pub async fn run(self, room: Option<&RoomHandle>) {
        let Self {
            handle,
            reader,
            writer,
            outbox,
        } = self;

        let mut outbound = tokio::spawn(write_loop(
            handle.id().clone(),
            writer,
            outbox,
            Arc::clone(&handle.closed),
        ));

        let inbound = read_loop(&handle, reader, room);
        tokio::pin!(inbound);

        let outbound_finished = tokio::select! {
            () = &mut inbound => false,
            result = &mut outbound => {
                if let Err(e) = result {
                    warn!(connection = %handle.id(), error = %e, "Outbound task failed");
                }
                true
            }
        };

        match room {
            Some(room) => {
                if !room.leave(handle.id()).await {
                    handle.close();
                }
            }
            None => handle.close(),
        }

        if !outbound_finished {
            if let Err(e) = outbound.await {
                warn!(connection = %handle.id(), error = %e, "Outbound task failed");
            }
        }

        debug!(connection = %handle.id(), user = %handle.name(), "Connection finished");
    }
}

async fn read_loop(
    handle: &ConnectionHandle,
    mut reader: Box<dyn FrameReader>,
    room: Option<&RoomHandle>,
) {
    loop {
        match reader.recv().await {
            Ok(Some(frame)) => {
                let Some(room) = room else {
                    trace!(connection = %handle.id(), "Ignoring frame from notification listener");
                    continue;
                };
                let stamped = stamp_inbound(&frame, handle.user_id());
                if !room.forward(stamped) {
                    debug!(
                        connection = %handle.id(),
                        room = %room.name(),
                        "Room mailbox full, frame dropped"
                    );
                }
            }
            Ok(None) => {
                debug!(connection = %handle.id(), "Connection closed by peer");
                return;
            }
            Err(e) => {
                debug!(connection = %handle.id(), error = %e, "Read failed");
                return;
            }
        }
    }
}

async fn write_loop(
    id: ConnectionId,
    mut writer: Box<dyn FrameWriter>,
    mut outbox: mpsc::Receiver<Bytes>,
    closed: Arc<Notify>,
) {
    loop {
        tokio::select! {
            frame = outbox.recv() => {
                let Some(frame) = frame else { break };
                if let Err(e) = writer.send(frame).await {
                    debug!(connection = %id, error = %e, "Write failed");
                    let _ = writer.close().await;
                    return;
                }
            }
            () = closed.notified() => {
                outbox.close();
                while let Some(frame) = outbox.recv().await {
                    if writer.send(frame).await.is_err() {
                        break;
                    }
                }
                break;
            }
        }
    }

    if let Err(e) = writer.close().await {
        debug!(connection = %id, error = %e, "Close failed");
    }
}
