//! In-memory duplex transport.
//!
//! [`pair`] returns the hub-side [`MemoryConnection`] and a [`MemoryPeer`]
//! that plays the client: it injects frames, reads what the hub wrote, and
//! can hang up or fail the transport.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::traits::{Connection, ConnectionId, FrameReader, FrameWriter, TransportError};

type Inbound = Result<Bytes, String>;

/// Hub side of an in-memory transport.
pub struct MemoryConnection {
    id: ConnectionId,
    inbound: mpsc::UnboundedReceiver<Inbound>,
    outbound: mpsc::UnboundedSender<Bytes>,
    closed: Arc<AtomicBool>,
}

/// Client side of an in-memory transport.
pub struct MemoryPeer {
    inbound: Option<mpsc::UnboundedSender<Inbound>>,
    outbound: mpsc::UnboundedReceiver<Bytes>,
    closed: Arc<AtomicBool>,
}

/// Create a connected transport and its peer.
#[must_use]
pub fn pair() -> (MemoryConnection, MemoryPeer) {
    let (in_tx, in_rx) = mpsc::unbounded_channel();
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let closed = Arc::new(AtomicBool::new(false));

    let conn = MemoryConnection {
        id: ConnectionId::generate(),
        inbound: in_rx,
        outbound: out_tx,
        closed: Arc::clone(&closed),
    };
    let peer = MemoryPeer {
        inbound: Some(in_tx),
        outbound: out_rx,
        closed,
    };
    (conn, peer)
}

impl MemoryPeer {
    /// Send a frame to the hub.
    ///
    /// # Errors
    ///
    /// Returns an error if the peer already hung up or the hub side is gone.
    pub fn send(&self, frame: impl Into<Bytes>) -> Result<(), TransportError> {
        self.inbound
            .as_ref()
            .ok_or(TransportError::ConnectionClosed)?
            .send(Ok(frame.into()))
            .map_err(|_| TransportError::ConnectionClosed)
    }

    /// Make the hub's next read fail with a transport error.
    pub fn fail(&self, reason: impl Into<String>) {
        if let Some(tx) = &self.inbound {
            let _ = tx.send(Err(reason.into()));
        }
    }

    /// Close the client side; the hub reads a clean close.
    pub fn hang_up(&mut self) {
        self.inbound = None;
    }

    /// Receive the next frame written by the hub.
    ///
    /// Returns `None` once the hub closed its writer and everything was read.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.outbound.recv().await
    }

    /// Receive a frame without waiting.
    pub fn try_recv(&mut self) -> Option<Bytes> {
        self.outbound.try_recv().ok()
    }

    /// Check whether the hub closed the transport.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Connection for MemoryConnection {
    fn id(&self) -> &ConnectionId {
        &self.id
    }

    fn remote_addr(&self) -> Option<String> {
        Some("memory".to_string())
    }

    fn split(self: Box<Self>) -> (Box<dyn FrameReader>, Box<dyn FrameWriter>) {
        let reader = MemoryReader {
            inbound: self.inbound,
        };
        let writer = MemoryWriter {
            outbound: Some(self.outbound),
            closed: self.closed,
        };
        (Box::new(reader), Box::new(writer))
    }
}

struct MemoryReader {
    inbound: mpsc::UnboundedReceiver<Inbound>,
}

#[async_trait]
impl FrameReader for MemoryReader {
    async fn recv(&mut self) -> Result<Option<Bytes>, TransportError> {
        match self.inbound.recv().await {
            Some(Ok(frame)) => Ok(Some(frame)),
            Some(Err(reason)) => Err(TransportError::ReceiveFailed(reason)),
            None => Ok(None),
        }
    }
}

struct MemoryWriter {
    outbound: Option<mpsc::UnboundedSender<Bytes>>,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl FrameWriter for MemoryWriter {
    async fn send(&mut self, frame: Bytes) -> Result<(), TransportError> {
        let tx = self
            .outbound
            .as_ref()
            .ok_or(TransportError::ConnectionClosed)?;
        tx.send(frame)
            .map_err(|_| TransportError::SendFailed("peer dropped".to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.outbound = None;
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
