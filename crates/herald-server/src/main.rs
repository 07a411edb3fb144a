//! # Herald Server
//!
//! Realtime notification server: pushes notifications to connected users over
//! WebSocket.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! herald
//!
//! # Config is read from ./herald.toml, /etc/herald/herald.toml or
//! # ~/.config/herald/herald.toml, then overridden from the environment
//! HERALD_PORT=8080 HERALD__HUB__OVERFLOW_POLICY=drop_oldest herald
//! ```

mod auth;
mod config;
mod error;
mod handlers;
mod metrics;

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "herald=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = config::Config::load()?;

    tracing::info!(
        overflow_policy = config.hub.overflow_policy.as_str(),
        queue_capacity = config.hub.queue_capacity,
        "Starting Herald server on {}:{}",
        config.host,
        config.port
    );

    handlers::run_server(config).await?;

    Ok(())
}
