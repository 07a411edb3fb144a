//! # herald-protocol
//!
//! Wire protocol definitions for the Herald realtime notification hub.
//!
//! This crate defines the value objects the hub routes and the frames
//! exchanged with connected clients:
//!
//! - `Notification` / `UserId` - what gets delivered, and to whom
//! - `ServerFrame` - `connected`, `notification`, `ping`, `pong`, `error`
//! - `ClientFrame` - `ping`, `pong`, `ack`
//! - `codec` - JSON text or length-prefixed MessagePack encoding
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use herald_protocol::{codec, Encoding, Notification, NotificationCategory, ServerFrame};
//!
//! let notification = Notification::new(NotificationCategory::Order, "Shipped", "Order #42 shipped")
//!     .for_user("user-42");
//! let frame = ServerFrame::notification(Arc::new(notification));
//!
//! let encoded = codec::encode(&frame, Encoding::Json).unwrap();
//! assert!(!encoded.is_empty());
//! ```

pub mod codec;
pub mod frames;
pub mod notification;
pub mod version;

pub use codec::{Encoded, Encoding, ProtocolError};
pub use frames::{error_codes, ClientFrame, ServerFrame};
pub use notification::{
    ExtraValue, Notification, NotificationCategory, NotificationData, Priority, UserId,
};
pub use version::{Version, PROTOCOL_VERSION};
