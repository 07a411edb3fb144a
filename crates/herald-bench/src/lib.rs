//! Shared fixtures for the Herald benchmarks.

use herald_core::{Connection, Hub, HubConfig, Registry};
use herald_protocol::{Encoding, Notification, NotificationCategory, UserId};
use herald_transport::memory::{self, MemoryClient};
use herald_transport::{ConnectionId, WireMessage};
use std::sync::Arc;

/// A typical order notification for `user`.
#[must_use]
pub fn sample_notification(user: &str) -> Arc<Notification> {
    Arc::new(
        Notification::new(
            NotificationCategory::Order,
            "Order shipped",
            "Your order #1234 is on its way",
        )
        .for_user(user),
    )
}

/// User IDs `user-0..user-{count}`.
#[must_use]
pub fn user_ids(count: usize) -> Vec<UserId> {
    (0..count).map(|i| UserId::new(format!("user-{i}"))).collect()
}

/// A registry with `users` users, each holding `devices` connections.
///
/// The connections have no writer attached; their queues only fill.
#[must_use]
pub fn populated_registry(users: usize, devices: usize, capacity: usize) -> Arc<Registry> {
    let registry = Arc::new(Registry::new());
    for user_id in user_ids(users) {
        for device in 0..devices {
            let id = ConnectionId::new(format!("{user_id}-{device}"));
            let conn = Arc::new(Connection::new(id, user_id.clone(), capacity));
            registry.add(user_id.clone(), conn);
        }
    }
    registry
}

/// Connect an in-memory client for `user` and consume the handshake.
///
/// # Panics
///
/// Panics if the hub refuses the connection.
pub async fn connect(hub: &Hub, user: &str) -> MemoryClient {
    let (transport, mut client) = memory::pair(1024);
    hub.accept(Some(UserId::new(user)), Box::new(transport), Encoding::Json)
        .await
        .expect("hub accepts benchmark client");
    match client.recv().await {
        Some(WireMessage::Text(_)) => client,
        other => panic!("expected connected frame, got {other:?}"),
    }
}

/// A hub sized for benchmarking: large queues and no heartbeats in the way.
#[must_use]
pub fn bench_hub() -> Hub {
    Hub::new(HubConfig {
        queue_capacity: 4096,
        heartbeat_interval: std::time::Duration::from_secs(3600),
        ..HubConfig::default()
    })
}
