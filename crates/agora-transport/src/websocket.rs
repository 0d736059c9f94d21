//! WebSocket transport implementation.
//!
//! This module adapts any tokio-tungstenite `WebSocketStream` (server or
//! client side) to the [`Connection`] trait.

use agora_protocol::{check_frame_size, MAX_FRAME_SIZE};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    accept_async, connect_async,
    tungstenite::{Error as WsError, Message},
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, error, warn};

use crate::traits::{Connection, ConnectionId, FrameReader, FrameWriter, TransportError};

/// A WebSocket connection.
pub struct WebSocketConnection<S> {
    id: ConnectionId,
    stream: WebSocketStream<S>,
    remote_addr: Option<SocketAddr>,
    max_message_size: usize,
}

impl<S> WebSocketConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Wrap an established WebSocket stream.
    #[must_use]
    pub fn new(stream: WebSocketStream<S>, remote_addr: Option<SocketAddr>) -> Self {
        Self {
            id: ConnectionId::generate(),
            stream,
            remote_addr,
            max_message_size: MAX_FRAME_SIZE,
        }
    }

    /// Set the maximum accepted frame size.
    #[must_use]
    pub fn with_max_message_size(mut self, max_message_size: usize) -> Self {
        self.max_message_size = max_message_size;
        self
    }
}

impl<S> Connection for WebSocketConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    fn id(&self) -> &ConnectionId {
        &self.id
    }

    fn remote_addr(&self) -> Option<String> {
        self.remote_addr.map(|a| a.to_string())
    }

    fn split(self: Box<Self>) -> (Box<dyn FrameReader>, Box<dyn FrameWriter>) {
        let (sink, stream) = self.stream.split();
        let reader = WebSocketReader {
            id: self.id.clone(),
            stream,
            max_message_size: self.max_message_size,
        };
        let writer = WebSocketWriter {
            id: self.id,
            sink,
            closed: false,
        };
        (Box::new(reader), Box::new(writer))
    }
}

struct WebSocketReader<S> {
    id: ConnectionId,
    stream: SplitStream<WebSocketStream<S>>,
    max_message_size: usize,
}

#[async_trait]
impl<S> FrameReader for WebSocketReader<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn recv(&mut self) -> Result<Option<Bytes>, TransportError> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    check_frame_size(text.len(), self.max_message_size)?;
                    return Ok(Some(Bytes::from(text)));
                }
                Some(Ok(Message::Binary(data))) => {
                    check_frame_size(data.len(), self.max_message_size)?;
                    return Ok(Some(Bytes::from(data)));
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {
                    // Pongs are queued by tungstenite itself
                }
                Some(Ok(Message::Close(_))) => {
                    debug!(connection = %self.id, "Received close frame");
                    return Ok(None);
                }
                Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) => {
                    debug!(connection = %self.id, "Connection closed");
                    return Ok(None);
                }
                Some(Err(e)) => {
                    error!(connection = %self.id, error = %e, "WebSocket error");
                    return Err(TransportError::ReceiveFailed(e.to_string()));
                }
                None => {
                    debug!(connection = %self.id, "WebSocket stream ended");
                    return Ok(None);
                }
            }
        }
    }
}

struct WebSocketWriter<S> {
    id: ConnectionId,
    sink: SplitSink<WebSocketStream<S>, Message>,
    closed: bool,
}

/// Text frames for UTF-8 payloads, binary otherwise.
fn to_message(frame: Bytes) -> Message {
    match String::from_utf8(frame.to_vec()) {
        Ok(text) => Message::Text(text),
        Err(e) => Message::Binary(e.into_bytes()),
    }
}

#[async_trait]
impl<S> FrameWriter for WebSocketWriter<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn send(&mut self, frame: Bytes) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::ConnectionClosed);
        }

        self.sink
            .send(to_message(frame))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        self.sink.close().await.map_err(|e| {
            warn!(connection = %self.id, error = %e, "Failed to close WebSocket");
            TransportError::SendFailed(e.to_string())
        })
    }
}

/// Perform the WebSocket handshake on an accepted TCP stream.
///
/// # Errors
///
/// Returns an error if the peer address is unavailable or the handshake fails.
pub async fn accept(stream: TcpStream) -> Result<WebSocketConnection<TcpStream>, TransportError> {
    let addr = stream.peer_addr()?;

    let ws_stream = accept_async(stream)
        .await
        .map_err(|e| TransportError::ReceiveFailed(format!("WebSocket handshake failed: {}", e)))?;

    debug!("WebSocket handshake completed with {}", addr);
    Ok(WebSocketConnection::new(ws_stream, Some(addr)))
}

/// Open a client connection to `url` (`ws://` or `wss://`).
///
/// # Errors
///
/// Returns an error if the connection or the handshake fails.
pub async fn connect(
    url: &str,
) -> Result<WebSocketConnection<MaybeTlsStream<TcpStream>>, TransportError> {
    let (ws_stream, _) = connect_async(url)
        .await
        .map_err(|e| TransportError::SendFailed(format!("WebSocket handshake failed: {}", e)))?;

    let remote_addr = match ws_stream.get_ref() {
        MaybeTlsStream::Plain(stream) => stream.peer_addr().ok(),
        _ => None,
    };
    debug!(url, "WebSocket client connected");
    Ok(WebSocketConnection::new(ws_stream, remote_addr))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn test_to_message_picks_frame_type() {
        assert!(matches!(
            to_message(Bytes::from_static(b"{\"a\":1}")),
            Message::Text(_)
        ));
        assert!(matches!(
            to_message(Bytes::from_static(&[0xff, 0xfe])),
            Message::Binary(_)
        ));
    }

    #[tokio::test]
    async fn test_websocket_duplex() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let conn = Box::new(accept(stream).await.unwrap());
            assert!(conn.remote_addr().is_some());
            let (mut reader, mut writer) = conn.split();

            let frame = reader.recv().await.unwrap().unwrap();
            writer.send(frame).await.unwrap();
            writer.close().await.unwrap();
            assert!(writer.send(Bytes::from_static(b"late")).await.is_err());
        });

        let client = Box::new(connect(&format!("ws://{}", addr)).await.unwrap());
        assert_eq!(client.remote_addr(), Some(addr.to_string()));
        let (mut reader, mut writer) = client.split();
        writer.send(Bytes::from_static(b"hello")).await.unwrap();

        assert_eq!(
            reader.recv().await.unwrap(),
            Some(Bytes::from_static(b"hello"))
        );
        assert_eq!(reader.recv().await.unwrap(), None);

        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_oversized_frame_is_rejected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let conn = Box::new(accept(stream).await.unwrap().with_max_message_size(8));
            let (mut reader, _writer) = conn.split();
            reader.recv().await
        });

        let (mut client, _) = connect_async(format!("ws://{}", addr)).await.unwrap();
        client
            .send(Message::Text("this is far too long".into()))
            .await
            .unwrap();

        let result = server.await.unwrap();
        assert!(matches!(result, Err(TransportError::Protocol(_))));
    }
}
