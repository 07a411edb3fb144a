//! Hub errors.

use thiserror::Error;

/// Errors surfaced synchronously when attaching a client.
#[derive(Debug, Error)]
pub enum HubError {
    /// No authenticated identity was attached to the upgrade.
    #[error("Authentication required")]
    AuthenticationRequired,

    /// The transport handshake failed or timed out.
    #[error("Upgrade failed: {0}")]
    UpgradeFailed(String),

    /// The hub has stopped accepting connections.
    #[error("Hub is shutting down")]
    ShuttingDown,

    /// The connection limit is reached.
    #[error("Connection limit of {limit} reached")]
    CapacityExceeded {
        /// Configured maximum.
        limit: usize,
    },
}

/// Why a single enqueue did not go through.
///
/// These are observability events: producers never see them.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryError {
    /// The queue was full and the notification was discarded.
    #[error("Delivery dropped: queue full")]
    Dropped,

    /// The connection is closed or draining.
    #[error("Connection closed")]
    ConnectionClosed,
}
