//! # agora-transport
//!
//! Transport abstraction layer for the Agora chat hub.
//!
//! The hub only needs a duplex stream of frames per client:
//!
//! - **WebSocket** - tokio-tungstenite streams, server or client side
//! - **axum** - sockets upgraded by axum's `WebSocketUpgrade`
//! - **Memory** - an in-process pair for tests and benchmarks
//!
//! ## Transport Abstraction
//!
//! All transports implement [`Connection`], which splits into a
//! [`FrameReader`] and a [`FrameWriter`] so that reading and writing can run
//! on separate tasks.
//!
//! ```rust,ignore
//! use agora_transport::Connection;
//!
//! async fn echo(conn: Box<dyn Connection>) {
//!     let (mut reader, mut writer) = conn.split();
//!     while let Ok(Some(frame)) = reader.recv().await {
//!         let _ = writer.send(frame).await;
//!     }
//! }
//! ```

pub mod memory;
pub mod traits;

#[cfg(feature = "websocket")]
pub mod websocket;

#[cfg(feature = "axum")]
pub mod axum_ws;

pub use traits::{Connection, ConnectionId, FrameReader, FrameWriter, TransportError};

#[cfg(feature = "websocket")]
pub use websocket::WebSocketConnection;

#[cfg(feature = "axum")]
pub use axum_ws::AxumConnection;
