//! Transport abstraction traits for Herald.
//!
//! A transport is split into a sink and a stream so that a connection's
//! writer and reader loops can run independently.

use async_trait::async_trait;
use bytes::Bytes;
use herald_protocol::Encoded;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Process-wide counter so IDs stay unique within the same nanosecond.
static ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Unique identifier for a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub String);

impl ConnectionId {
    /// Create a new connection ID.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a unique connection ID.
    #[must_use]
    pub fn generate() -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        let counter = ID_COUNTER.fetch_add(1, Ordering::Relaxed);
        Self(format!("conn_{:x}_{:x}", timestamp, counter))
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ConnectionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Close handshake details.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseFrame {
    /// WebSocket close code.
    pub code: u16,
    /// Human-readable reason.
    pub reason: String,
}

impl CloseFrame {
    /// Normal closure.
    pub const NORMAL: u16 = 1000;
    /// Server going away (shutdown).
    pub const GOING_AWAY: u16 = 1001;
    /// Policy violation (stale, overflow, kicked).
    pub const POLICY: u16 = 1008;

    /// Create a close frame.
    #[must_use]
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }
}

/// A transport-level message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    Text(String),
    Binary(Bytes),
    Ping(Bytes),
    Pong(Bytes),
    Close(Option<CloseFrame>),
}

impl WireMessage {
    /// Check if this is a data message (text or binary).
    #[must_use]
    pub fn is_data(&self) -> bool {
        matches!(self, WireMessage::Text(_) | WireMessage::Binary(_))
    }
}

impl From<Encoded> for WireMessage {
    fn from(encoded: Encoded) -> Self {
        match encoded {
            Encoded::Text(text) => WireMessage::Text(text),
            Encoded::Binary(bytes) => WireMessage::Binary(bytes),
        }
    }
}

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection was closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Operation timed out.
    #[error("Connection timed out")]
    Timeout,

    /// Failed to send data.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Failed to receive data.
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    /// Protocol error.
    #[error("Protocol error: {0}")]
    Protocol(#[from] herald_protocol::ProtocolError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// The outbound half of a transport.
#[async_trait]
pub trait TransportSink: Send {
    /// Send one message. May suspend while the peer applies backpressure.
    async fn send(&mut self, message: WireMessage) -> Result<(), TransportError>;

    /// Close the outbound half, sending a close frame if the protocol has one.
    async fn close(&mut self, frame: Option<CloseFrame>) -> Result<(), TransportError>;
}

/// The inbound half of a transport.
#[async_trait]
pub trait TransportStream: Send {
    /// Receive the next message.
    ///
    /// Returns `None` once the peer is gone.
    async fn recv(&mut self) -> Result<Option<WireMessage>, TransportError>;
}

/// An accepted, upgraded transport session.
pub trait Transport: Send {
    /// Transport name (e.g., "websocket", "memory").
    fn name(&self) -> &'static str;

    /// Remote address of the peer, if known.
    fn remote_addr(&self) -> Option<String> {
        None
    }

    /// Split into independently owned outbound and inbound halves.
    fn split(self: Box<Self>) -> (Box<dyn TransportSink>, Box<dyn TransportStream>);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_id_generation() {
        let id1 = ConnectionId::generate();
        let id2 = ConnectionId::generate();
        assert_ne!(id1, id2);
        assert!(id1.as_str().starts_with("conn_"));
    }

    #[test]
    fn test_connection_id_from_string() {
        let id: ConnectionId = "test-id".into();
        assert_eq!(id.as_str(), "test-id");
    }

    #[test]
    fn test_wire_message_from_encoded() {
        let msg: WireMessage = Encoded::Text("{}".to_string()).into();
        assert_eq!(msg, WireMessage::Text("{}".to_string()));
        assert!(msg.is_data());
        assert!(!WireMessage::Ping(Bytes::new()).is_data());
    }
}
