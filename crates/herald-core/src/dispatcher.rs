//! Notification dispatcher.
//!
//! Resolves targets through the [`Registry`] and enqueues onto each
//! connection without ever waiting on a slow one. Overflow is resolved per
//! connection by the configured [`OverflowPolicy`].

use herald_protocol::{Notification, UserId};
use serde::Serialize;
use std::ops::AddAssign;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

use crate::config::OverflowPolicy;
use crate::connection::{CloseReason, Connection};
use crate::error::DeliveryError;
use crate::metrics;
use crate::registry::Registry;

/// Outcome of routing one notification.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeliveryReport {
    /// Users the notification was routed to.
    pub users: usize,
    /// Connections an enqueue was attempted on.
    pub attempted: usize,
    /// Enqueued successfully (including those that displaced an older one).
    pub delivered: usize,
    /// Discarded because a queue was full.
    pub dropped: usize,
    /// Older notifications evicted to make room.
    pub evicted: usize,
    /// Skipped because the connection was closing.
    pub closed: usize,
    /// Connections closed by the close-connection policy.
    pub disconnected: usize,
}

impl AddAssign for DeliveryReport {
    fn add_assign(&mut self, other: Self) {
        self.users += other.users;
        self.attempted += other.attempted;
        self.delivered += other.delivered;
        self.dropped += other.dropped;
        self.evicted += other.evicted;
        self.closed += other.closed;
        self.disconnected += other.disconnected;
    }
}

/// Cumulative delivery counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeliveryTotals {
    pub delivered: u64,
    pub dropped: u64,
    pub evicted: u64,
    pub failed: u64,
}

/// Routes notifications to registered connections.
#[derive(Debug)]
pub struct Dispatcher {
    registry: Arc<Registry>,
    policy: OverflowPolicy,
    delivered: AtomicU64,
    dropped: AtomicU64,
    evicted: AtomicU64,
    failed: AtomicU64,
}

impl Dispatcher {
    /// Create a dispatcher over a registry.
    #[must_use]
    pub fn new(registry: Arc<Registry>, policy: OverflowPolicy) -> Self {
        Self {
            registry,
            policy,
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            evicted: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    /// Enqueue a notification on every connection of one user.
    ///
    /// An unknown or offline user yields an empty report.
    pub fn route_to_user(&self, user_id: &UserId, notification: Arc<Notification>) -> DeliveryReport {
        let connections = self.registry.lookup(user_id);
        if connections.is_empty() {
            trace!(user = %user_id, "No connections for user");
            return DeliveryReport::default();
        }

        let mut report = DeliveryReport {
            users: 1,
            ..DeliveryReport::default()
        };
        for conn in &connections {
            self.deliver(conn, Arc::clone(&notification), &mut report);
        }

        self.account(&report);
        report
    }

    /// Enqueue a notification on every registered connection.
    pub fn broadcast(&self, notification: Arc<Notification>) -> DeliveryReport {
        let mut report = DeliveryReport::default();
        for user_id in self.registry.all_users() {
            report += self.route_to_user(&user_id, Arc::clone(&notification));
        }

        metrics::record_broadcast();
        debug!(
            notification = %notification.id,
            users = report.users,
            delivered = report.delivered,
            dropped = report.dropped,
            "Broadcast dispatched"
        );
        report
    }

    /// Cumulative counters since start.
    #[must_use]
    pub fn totals(&self) -> DeliveryTotals {
        DeliveryTotals {
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }

    fn deliver(&self, conn: &Connection, notification: Arc<Notification>, report: &mut DeliveryReport) {
        report.attempted += 1;

        let outcome = match self.policy {
            OverflowPolicy::DropNewest => conn.try_enqueue(notification),
            OverflowPolicy::DropOldest => conn.enqueue_displacing(notification).map(|evicted| {
                if evicted.is_some() {
                    report.evicted += 1;
                }
            }),
            OverflowPolicy::CloseConnection => match conn.try_enqueue(notification) {
                Err(DeliveryError::Dropped) => {
                    if conn.close(CloseReason::Overflow) {
                        report.disconnected += 1;
                    }
                    Err(DeliveryError::Dropped)
                }
                other => other,
            },
        };

        match outcome {
            Ok(()) => report.delivered += 1,
            Err(DeliveryError::Dropped) => {
                report.dropped += 1;
                debug!(
                    connection = %conn.id(),
                    user = %conn.user_id(),
                    policy = self.policy.as_str(),
                    "Delivery dropped: queue full"
                );
            }
            Err(DeliveryError::ConnectionClosed) => {
                report.closed += 1;
                trace!(connection = %conn.id(), "Skipping closed connection");
            }
        }
    }

    fn account(&self, report: &DeliveryReport) {
        self.delivered.fetch_add(report.delivered as u64, Ordering::Relaxed);
        self.dropped.fetch_add(report.dropped as u64, Ordering::Relaxed);
        self.evicted.fetch_add(report.evicted as u64, Ordering::Relaxed);
        self.failed.fetch_add(report.closed as u64, Ordering::Relaxed);

        metrics::record_deliveries("delivered", report.delivered as u64);
        metrics::record_deliveries("dropped", report.dropped as u64);
        metrics::record_deliveries("evicted", report.evicted as u64);
        metrics::record_deliveries("closed", report.closed as u64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use herald_protocol::NotificationCategory;
    use herald_transport::ConnectionId;

    fn setup(policy: OverflowPolicy) -> (Arc<Registry>, Dispatcher) {
        let registry = Arc::new(Registry::new());
        let dispatcher = Dispatcher::new(Arc::clone(&registry), policy);
        (registry, dispatcher)
    }

    fn register(registry: &Registry, user: &str, id: &str, capacity: usize) -> Arc<Connection> {
        let user = UserId::new(user);
        let conn = Arc::new(Connection::new(ConnectionId::new(id), user.clone(), capacity));
        registry.add(user, Arc::clone(&conn));
        conn
    }

    fn notification(title: &str) -> Arc<Notification> {
        Arc::new(Notification::new(NotificationCategory::Payment, title, "body"))
    }

    #[test]
    fn test_route_to_all_user_connections() {
        let (registry, dispatcher) = setup(OverflowPolicy::DropNewest);
        let c1 = register(&registry, "u1", "c1", 4);
        let c2 = register(&registry, "u1", "c2", 4);
        let other = register(&registry, "u2", "c3", 4);

        let report = dispatcher.route_to_user(&UserId::new("u1"), notification("paid"));

        assert_eq!(report.users, 1);
        assert_eq!(report.attempted, 2);
        assert_eq!(report.delivered, 2);
        assert_eq!(c1.queue_len(), 1);
        assert_eq!(c2.queue_len(), 1);
        assert_eq!(other.queue_len(), 0);
    }

    #[test]
    fn test_unknown_user_is_noop() {
        let (_registry, dispatcher) = setup(OverflowPolicy::DropNewest);
        let report = dispatcher.route_to_user(&UserId::new("ghost"), notification("x"));
        assert_eq!(report, DeliveryReport::default());
    }

    #[test]
    fn test_drop_newest_reports_drops() {
        let (registry, dispatcher) = setup(OverflowPolicy::DropNewest);
        let conn = register(&registry, "u1", "c1", 2);
        let user = UserId::new("u1");

        let mut total = DeliveryReport::default();
        for i in 0..5 {
            total += dispatcher.route_to_user(&user, notification(&format!("n{i}")));
        }

        assert_eq!(total.delivered, 2);
        assert_eq!(total.dropped, 3);
        assert_eq!(conn.queue_len(), 2);
        assert_eq!(dispatcher.totals().dropped, 3);
    }

    #[test]
    fn test_drop_oldest_keeps_latest() {
        let (registry, dispatcher) = setup(OverflowPolicy::DropOldest);
        let conn = register(&registry, "u1", "c1", 2);
        let user = UserId::new("u1");

        let mut total = DeliveryReport::default();
        for i in 0..5 {
            total += dispatcher.route_to_user(&user, notification(&format!("n{i}")));
        }

        assert_eq!(total.delivered, 5);
        assert_eq!(total.evicted, 3);
        assert_eq!(total.dropped, 0);
        assert_eq!(conn.queue_len(), 2);
        assert!(conn.is_active());
    }

    #[test]
    fn test_close_connection_policy() {
        let (registry, dispatcher) = setup(OverflowPolicy::CloseConnection);
        let slow = register(&registry, "u1", "slow", 1);
        let fast = register(&registry, "u1", "fast", 8);
        let user = UserId::new("u1");

        dispatcher.route_to_user(&user, notification("a"));
        let report = dispatcher.route_to_user(&user, notification("b"));

        assert_eq!(report.disconnected, 1);
        assert_eq!(report.dropped, 1);
        assert_eq!(report.delivered, 1);
        assert_eq!(slow.close_reason(), Some(CloseReason::Overflow));
        assert_eq!(fast.queue_len(), 2);

        let report = dispatcher.route_to_user(&user, notification("c"));
        assert_eq!(report.closed, 1);
        assert_eq!(report.delivered, 1);
    }

    #[test]
    fn test_broadcast_reaches_every_connection() {
        let (registry, dispatcher) = setup(OverflowPolicy::DropNewest);
        let conns: Vec<_> = (0..6)
            .map(|i| register(&registry, &format!("u{}", i % 3), &format!("c{i}"), 4))
            .collect();

        let report = dispatcher.broadcast(notification("maintenance"));

        assert_eq!(report.users, 3);
        assert_eq!(report.attempted, 6);
        assert_eq!(report.delivered, 6);
        assert!(conns.iter().all(|c| c.queue_len() == 1));
    }

    #[test]
    fn test_slow_connection_does_not_block_others() {
        let (registry, dispatcher) = setup(OverflowPolicy::DropNewest);
        let slow = register(&registry, "u1", "slow", 1);
        let fast = register(&registry, "u2", "fast", 64);

        for i in 0..32 {
            dispatcher.broadcast(notification(&format!("n{i}")));
        }

        assert_eq!(slow.queue_len(), 1);
        assert_eq!(fast.queue_len(), 32);
    }
}
