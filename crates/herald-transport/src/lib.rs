//! # herald-transport
//!
//! Transport abstraction layer for the Herald notification hub.
//!
//! - **WebSocket** - axum upgraded sockets (feature `websocket`, default)
//! - **Memory** - bounded in-process channels for tests and benchmarks
//!
//! ## Transport Abstraction
//!
//! Every transport splits into a [`TransportSink`] and a [`TransportStream`]
//! so the hub can run a connection's writer and reader independently.
//!
//! ```rust,ignore
//! use herald_transport::{Transport, WireMessage};
//!
//! async fn echo(transport: Box<dyn Transport>) {
//!     let (mut sink, mut stream) = transport.split();
//!     while let Ok(Some(message)) = stream.recv().await {
//!         if sink.send(message).await.is_err() {
//!             break;
//!         }
//!     }
//! }
//! ```

pub mod memory;
pub mod traits;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use traits::{
    CloseFrame, ConnectionId, Transport, TransportError, TransportSink, TransportStream,
    WireMessage,
};

#[cfg(feature = "websocket")]
pub use websocket::WebSocketTransport;
