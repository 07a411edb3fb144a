//! Server configuration.
//!
//! Configuration is layered with the `config` crate:
//! - TOML file (`herald.toml`, `/etc/herald/herald.toml`, `~/.config/herald/herald.toml`)
//! - Environment variables (`HERALD__SECTION__KEY`, e.g. `HERALD__HUB__QUEUE_CAPACITY`)
//!
//! `HERALD_HOST` and `HERALD_PORT` supply the defaults for `host` and `port`.
//! Admin and publish routes bind to `[internal]`, which defaults to loopback.

use ::config::{Environment, File, FileFormat};
use anyhow::{ensure, Context, Result};
use herald_core::{HubConfig, OverflowPolicy};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Files searched, first match wins.
const CONFIG_PATHS: [&str; 3] = [
    "herald.toml",
    "/etc/herald/herald.toml",
    "~/.config/herald/herald.toml",
];

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Listener for admin and publish routes.
    #[serde(default)]
    pub internal: InternalConfig,

    /// Transport configuration.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Hub capacity and timeouts.
    #[serde(default)]
    pub hub: HubSection,

    /// Heartbeat configuration.
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    /// Identity propagation.
    #[serde(default)]
    pub auth: AuthConfig,

    /// Graceful shutdown.
    #[serde(default)]
    pub shutdown: ShutdownConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Internal listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InternalConfig {
    /// Host to bind to; keep this off the public network.
    #[serde(default = "default_internal_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_internal_port")]
    pub port: u16,
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Path for WebSocket endpoint.
    #[serde(default = "default_ws_path")]
    pub websocket_path: String,
}

/// Hub capacity and timeouts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubSection {
    /// Notifications buffered per connection.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// What to do with a full queue.
    #[serde(default)]
    pub overflow_policy: OverflowPolicy,

    /// Maximum number of connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Handshake write timeout in milliseconds.
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_ms: u64,

    /// Per-write timeout in milliseconds.
    #[serde(default = "default_write_timeout")]
    pub write_timeout_ms: u64,

    /// Stale-connection scan interval in milliseconds.
    #[serde(default = "default_reap_interval")]
    pub reap_interval_ms: u64,
}

/// Heartbeat configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Heartbeat interval in milliseconds.
    #[serde(default = "default_heartbeat_interval")]
    pub interval_ms: u64,

    /// Connection timeout in milliseconds.
    #[serde(default = "default_heartbeat_timeout")]
    pub timeout_ms: u64,
}

/// Identity propagation from the upstream auth layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Trusted header carrying the authenticated user ID.
    #[serde(default = "default_user_header")]
    pub user_header: String,
}

/// Graceful shutdown configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownConfig {
    /// Drain deadline in milliseconds before connections are force-closed.
    #[serde(default = "default_shutdown_timeout")]
    pub timeout_ms: u64,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default value functions
fn default_host() -> String {
    std::env::var("HERALD_HOST").unwrap_or_else(|_| "127.0.0.1".to_string())
}

fn default_port() -> u16 {
    std::env::var("HERALD_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8080)
}

fn default_internal_host() -> String {
    "127.0.0.1".to_string()
}

fn default_internal_port() -> u16 {
    8081
}

fn default_true() -> bool {
    true
}

fn default_ws_path() -> String {
    "/ws".to_string()
}

fn default_queue_capacity() -> usize {
    256
}

fn default_max_connections() -> usize {
    100_000
}

fn default_handshake_timeout() -> u64 {
    5_000
}

fn default_write_timeout() -> u64 {
    10_000
}

fn default_reap_interval() -> u64 {
    15_000
}

fn default_heartbeat_interval() -> u64 {
    30_000 // 30 seconds
}

fn default_heartbeat_timeout() -> u64 {
    60_000 // 60 seconds
}

fn default_user_header() -> String {
    "x-user-id".to_string()
}

fn default_shutdown_timeout() -> u64 {
    10_000
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            internal: InternalConfig::default(),
            transport: TransportConfig::default(),
            hub: HubSection::default(),
            heartbeat: HeartbeatConfig::default(),
            auth: AuthConfig::default(),
            shutdown: ShutdownConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for InternalConfig {
    fn default() -> Self {
        Self {
            host: default_internal_host(),
            port: default_internal_port(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            websocket_path: default_ws_path(),
        }
    }
}

impl Default for HubSection {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            overflow_policy: OverflowPolicy::default(),
            max_connections: default_max_connections(),
            handshake_timeout_ms: default_handshake_timeout(),
            write_timeout_ms: default_write_timeout(),
            reap_interval_ms: default_reap_interval(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_heartbeat_interval(),
            timeout_ms: default_heartbeat_timeout(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            user_header: default_user_header(),
        }
    }
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_shutdown_timeout(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl Config {
    /// Load configuration from the first config file found, overlaid with
    /// `HERALD__*` environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed, an
    /// environment override has the wrong type, or [`Config::validate`] fails.
    pub fn load() -> Result<Self> {
        let mut builder = ::config::Config::builder();

        for path in &CONFIG_PATHS {
            let expanded = shellexpand::tilde(path);
            let candidate = Path::new(expanded.as_ref());
            if candidate.exists() {
                tracing::debug!(path = %candidate.display(), "Using config file");
                builder = builder.add_source(File::from(candidate).format(FileFormat::Toml));
                break;
            }
        }

        let settings = builder
            .add_source(environment())
            .build()
            .context("Failed to read configuration")?;

        let config: Self = settings
            .try_deserialize()
            .context("Failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the hub cannot run with.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first zero interval, timeout or capacity.
    pub fn validate(&self) -> Result<()> {
        ensure!(self.heartbeat.interval_ms > 0, "heartbeat.interval_ms must be positive");
        ensure!(self.heartbeat.timeout_ms > 0, "heartbeat.timeout_ms must be positive");
        ensure!(self.hub.reap_interval_ms > 0, "hub.reap_interval_ms must be positive");
        ensure!(self.hub.write_timeout_ms > 0, "hub.write_timeout_ms must be positive");
        ensure!(
            self.hub.handshake_timeout_ms > 0,
            "hub.handshake_timeout_ms must be positive"
        );
        ensure!(self.hub.queue_capacity > 0, "hub.queue_capacity must be positive");
        ensure!(
            (self.internal.host.as_str(), self.internal.port) != (self.host.as_str(), self.port),
            "internal listener must not share the public address"
        );
        Ok(())
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if `host:port` is not a valid socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid bind address {}:{}", self.host, self.port))
    }

    /// Get the socket address for admin and publish routes.
    ///
    /// # Errors
    ///
    /// Returns an error if `internal.host:internal.port` is not a valid socket address.
    pub fn internal_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.internal.host, self.internal.port)
            .parse()
            .with_context(|| {
                format!("Invalid internal address {}:{}", self.internal.host, self.internal.port)
            })
    }

    /// Build the hub configuration.
    #[must_use]
    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            queue_capacity: self.hub.queue_capacity,
            overflow_policy: self.hub.overflow_policy,
            max_connections: self.hub.max_connections,
            handshake_timeout: Duration::from_millis(self.hub.handshake_timeout_ms),
            write_timeout: Duration::from_millis(self.hub.write_timeout_ms),
            heartbeat_interval: Duration::from_millis(self.heartbeat.interval_ms),
            client_timeout: Duration::from_millis(self.heartbeat.timeout_ms),
            reap_interval: Duration::from_millis(self.hub.reap_interval_ms),
        }
    }

    /// Drain deadline for graceful shutdown.
    #[must_use]
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown.timeout_ms)
    }
}

fn environment() -> Environment {
    Environment::with_prefix("HERALD")
        .prefix_separator("__")
        .separator("__")
        .try_parsing(true)
}
