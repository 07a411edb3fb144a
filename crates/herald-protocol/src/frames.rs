//! Frame types for the Herald protocol.
//!
//! Server frames flow hub → client; client frames flow client → hub.
//! Both are internally tagged by a `type` field.

use crate::notification::{Notification, UserId};
use crate::version::Version;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// Error codes carried in [`ServerFrame::Error`].
pub mod error_codes {
    /// The client sent a frame the server could not decode.
    pub const MALFORMED_FRAME: u16 = 1001;
}

/// A frame sent by the hub.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerFrame {
    /// Handshake completed.
    #[serde(rename = "connected")]
    Connected {
        /// Unique connection identifier.
        connection_id: String,
        /// The authenticated user this connection belongs to.
        user_id: UserId,
        /// Protocol version spoken by the server.
        version: Version,
        /// Heartbeat interval in milliseconds.
        heartbeat: u32,
    },

    /// A delivered notification.
    #[serde(rename = "notification")]
    Notification {
        /// The notification, serialized verbatim.
        notification: Arc<Notification>,
    },

    /// Keepalive ping.
    #[serde(rename = "ping")]
    Ping {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },

    /// Reply to a client ping.
    #[serde(rename = "pong")]
    Pong {
        /// Echoed timestamp from the ping.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },

    /// Error notice.
    #[serde(rename = "error")]
    Error {
        /// Error code, see [`error_codes`].
        code: u16,
        /// Human-readable message.
        message: String,
    },
}

impl ServerFrame {
    /// Create a Connected frame.
    #[must_use]
    pub fn connected(
        connection_id: impl Into<String>,
        user_id: UserId,
        version: Version,
        heartbeat: u32,
    ) -> Self {
        ServerFrame::Connected {
            connection_id: connection_id.into(),
            user_id,
            version,
            heartbeat,
        }
    }

    /// Create a Notification frame sharing the given notification.
    #[must_use]
    pub fn notification(notification: Arc<Notification>) -> Self {
        ServerFrame::Notification { notification }
    }

    /// Create a Ping frame.
    #[must_use]
    pub fn ping(timestamp: Option<u64>) -> Self {
        ServerFrame::Ping { timestamp }
    }

    /// Create a Pong frame.
    #[must_use]
    pub fn pong(timestamp: Option<u64>) -> Self {
        ServerFrame::Pong { timestamp }
    }

    /// Create an Error frame.
    #[must_use]
    pub fn error(code: u16, message: impl Into<String>) -> Self {
        ServerFrame::Error {
            code,
            message: message.into(),
        }
    }

    /// Short name used in logs and metric labels.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            ServerFrame::Connected { .. } => "connected",
            ServerFrame::Notification { .. } => "notification",
            ServerFrame::Ping { .. } => "ping",
            ServerFrame::Pong { .. } => "pong",
            ServerFrame::Error { .. } => "error",
        }
    }
}

/// A frame sent by a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientFrame {
    /// Application-level ping; answered with a pong.
    #[serde(rename = "ping")]
    Ping {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },

    /// Reply to a server ping.
    #[serde(rename = "pong")]
    Pong {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },

    /// The client displayed a notification.
    #[serde(rename = "ack")]
    Ack {
        /// ID of the acknowledged notification.
        id: Uuid,
    },
}
