//! # herald-core
//!
//! Connection registry, fan-out dispatcher and hub for the Herald realtime
//! notification engine.
//!
//! - **Registry** - sharded map from user to their live connections
//! - **Connection** - bounded outbound queue driven by a reader and a writer loop
//! - **Dispatcher** - non-blocking per-user and broadcast fan-out with an overflow policy
//! - **Hub** - the facade: accepts transports, routes notifications, reaps and shuts down
//!
//! ## Architecture
//!
//! ```text
//! producer ──▶ ┌───────┐ ──▶ ┌────────────┐ ──▶ ┌──────────┐
//!              │  Hub  │     │ Dispatcher │     │ Registry │
//! transport ─▶ └───────┘     └────────────┘     └──────────┘
//!                  │               │ enqueue          │
//!                  ▼               ▼                  │
//!            ┌──────────────────────────┐             │
//!            │ Connection (queue)       │◀────────────┘
//!            │   reader ◀── transport   │
//!            │   writer ──▶ transport   │
//!            └──────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use herald_core::{Hub, HubConfig};
//! use herald_protocol::{Notification, NotificationCategory, UserId};
//!
//! # async fn run() {
//! let hub = Hub::new(HubConfig::default());
//! let report = hub.send_to_user(
//!     &UserId::new("user-42"),
//!     Notification::new(NotificationCategory::Order, "Shipped", "Order #42 shipped"),
//! );
//! assert_eq!(report.attempted, 0); // nobody connected yet
//! hub.shutdown(std::time::Duration::from_secs(5)).await;
//! # }
//! ```

pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod hub;
pub mod metrics;
pub mod registry;

pub use config::{HubConfig, OverflowPolicy};
pub use connection::{CloseReason, Connection, ConnectionInfo, ConnectionState};
pub use dispatcher::{DeliveryReport, DeliveryTotals, Dispatcher};
pub use error::{DeliveryError, HubError};
pub use hub::{Hub, HubStats, ShutdownReport};
pub use registry::{Registry, RegistrySnapshot};
