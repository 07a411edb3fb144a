//! Hub configuration.

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

/// What to do when a connection's outbound queue is full.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Discard the notification being delivered.
    #[default]
    DropNewest,
    /// Evict the oldest queued notification to make room.
    DropOldest,
    /// Close the lagging connection.
    CloseConnection,
}

impl OverflowPolicy {
    /// Name used in configuration and logs.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            OverflowPolicy::DropNewest => "drop_newest",
            OverflowPolicy::DropOldest => "drop_oldest",
            OverflowPolicy::CloseConnection => "close_connection",
        }
    }
}

impl FromStr for OverflowPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "drop_newest" => Ok(OverflowPolicy::DropNewest),
            "drop_oldest" => Ok(OverflowPolicy::DropOldest),
            "close_connection" => Ok(OverflowPolicy::CloseConnection),
            other => Err(format!("unknown overflow policy: {other}")),
        }
    }
}

/// Hub configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Maximum notifications buffered per connection.
    pub queue_capacity: usize,
    /// Policy applied when a queue is full.
    pub overflow_policy: OverflowPolicy,
    /// Maximum concurrent connections across all users.
    pub max_connections: usize,
    /// Time allowed to write the `connected` handshake frame.
    pub handshake_timeout: Duration,
    /// Time allowed for a single transport write.
    pub write_timeout: Duration,
    /// Interval between server heartbeat pings.
    pub heartbeat_interval: Duration,
    /// A connection silent for longer than this is reaped.
    pub client_timeout: Duration,
    /// How often the reaper scans for stale connections.
    pub reap_interval: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            overflow_policy: OverflowPolicy::default(),
            max_connections: 100_000,
            handshake_timeout: Duration::from_secs(5),
            write_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(30),
            client_timeout: Duration::from_secs(60),
            reap_interval: Duration::from_secs(15),
        }
    }
}

impl HubConfig {
    /// Shortest period accepted for the heartbeat and reaper timers.
    pub const MIN_INTERVAL: Duration = Duration::from_millis(1);

    /// Raise zero timer periods to [`HubConfig::MIN_INTERVAL`].
    ///
    /// Tokio intervals panic on a zero period, so a hub never runs with one.
    #[must_use]
    pub fn normalized(mut self) -> Self {
        self.heartbeat_interval = self.heartbeat_interval.max(Self::MIN_INTERVAL);
        self.reap_interval = self.reap_interval.max(Self::MIN_INTERVAL);
        self.queue_capacity = self.queue_capacity.max(1);
        self
    }
}
