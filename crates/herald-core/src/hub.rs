//! The notification hub.
//!
//! [`Hub`] is the single entry point the rest of the application talks to:
//! transports are handed to [`Hub::accept`], producers call
//! [`Hub::send_to_user`] / [`Hub::send_to_all`], and operators read
//! [`Hub::stats`]. One instance is built at startup and shared as `Arc<Hub>`.

use herald_protocol::{codec, Encoding, Notification, ServerFrame, UserId, PROTOCOL_VERSION};
use herald_transport::{CloseFrame, ConnectionId, Transport};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::config::HubConfig;
use crate::connection::{self, CloseReason, Connection, ConnectionInfo, LoopSettings};
use crate::dispatcher::{DeliveryReport, Dispatcher};
use crate::error::HubError;
use crate::metrics;
use crate::registry::Registry;

/// Time allowed for the close handshake when refusing a client.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Point-in-time hub statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HubStats {
    /// Registered connections.
    pub connection_count: usize,
    /// Users with at least one connection.
    pub user_count: usize,
    /// Connections held → number of users holding that many.
    pub connections_per_user: BTreeMap<usize, usize>,
    /// Notifications enqueued since start.
    pub delivered: u64,
    /// Notifications discarded on full queues.
    pub dropped: u64,
    /// Queued notifications evicted by the drop-oldest policy.
    pub evicted: u64,
    /// Enqueues that hit a closing connection.
    pub failed: u64,
    /// Connections accepted since start.
    pub accepted_total: u64,
    /// Connections refused since start.
    pub rejected_total: u64,
    /// Whether new connections are accepted.
    pub accepting: bool,
}

/// Outcome of [`Hub::shutdown`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    /// Connections registered when shutdown began.
    pub connections: usize,
    /// Connections force-closed after the drain deadline.
    pub forced: usize,
}

/// Realtime notification hub.
#[derive(Debug)]
pub struct Hub {
    config: HubConfig,
    registry: Arc<Registry>,
    dispatcher: Dispatcher,
    accepting: AtomicBool,
    shutdown: CancellationToken,
    tasks: TaskTracker,
    /// Admitted connections, including those still handshaking.
    live: Arc<AtomicUsize>,
    accepted: AtomicU64,
    rejected: AtomicU64,
}

impl Hub {
    /// Create a hub.
    #[must_use]
    pub fn new(config: HubConfig) -> Self {
        let config = config.normalized();
        let registry = Arc::new(Registry::new());
        let dispatcher = Dispatcher::new(Arc::clone(&registry), config.overflow_policy);

        Self {
            config,
            registry,
            dispatcher,
            accepting: AtomicBool::new(true),
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
            live: Arc::new(AtomicUsize::new(0)),
            accepted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    /// Get the configuration.
    #[must_use]
    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// Get the registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Check if new connections are accepted.
    #[must_use]
    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    /// Check whether a client with this identity could be admitted right now.
    ///
    /// Lets an HTTP layer refuse before completing a protocol upgrade.
    ///
    /// # Errors
    ///
    /// The same admission errors [`Hub::accept`] returns.
    pub fn check_admission(&self, identity: Option<&UserId>) -> Result<(), HubError> {
        if identity.is_none() {
            return Err(self.reject(HubError::AuthenticationRequired));
        }
        if !self.is_accepting() {
            return Err(self.reject(HubError::ShuttingDown));
        }
        if self.live.load(Ordering::SeqCst) >= self.config.max_connections {
            return Err(self.reject(HubError::CapacityExceeded {
                limit: self.config.max_connections,
            }));
        }
        Ok(())
    }

    /// Attach an upgraded transport as a new connection.
    ///
    /// Registers the connection, sends the `connected` handshake frame and
    /// spawns its supervisor. The supervisor deregisters the connection once
    /// both loops have stopped and the transport is released.
    ///
    /// # Errors
    ///
    /// - [`HubError::AuthenticationRequired`] if `identity` is `None`
    /// - [`HubError::ShuttingDown`] once shutdown has begun
    /// - [`HubError::CapacityExceeded`] past `max_connections`
    /// - [`HubError::UpgradeFailed`] if the handshake cannot be written in time
    pub async fn accept(
        &self,
        identity: Option<UserId>,
        transport: Box<dyn Transport>,
        encoding: Encoding,
    ) -> Result<ConnectionId, HubError> {
        let Some(user_id) = identity else {
            return Err(self.refuse(transport, HubError::AuthenticationRequired).await);
        };
        if !self.is_accepting() {
            return Err(self.refuse(transport, HubError::ShuttingDown).await);
        }
        if self.live.fetch_add(1, Ordering::SeqCst) >= self.config.max_connections {
            self.live.fetch_sub(1, Ordering::SeqCst);
            warn!(user = %user_id, limit = self.config.max_connections, "Connection limit reached");
            let limit = self.config.max_connections;
            return Err(self.refuse(transport, HubError::CapacityExceeded { limit }).await);
        }

        // Keeps `shutdown` waiting on this connection while it handshakes.
        let tracked = self.tasks.token();
        let name = transport.name();
        let remote_addr = transport.remote_addr();
        let (mut sink, stream) = transport.split();
        let conn = Arc::new(
            Connection::new(ConnectionId::generate(), user_id.clone(), self.config.queue_capacity)
                .with_encoding(encoding)
                .with_transport(name, remote_addr),
        );

        // Registered before the handshake so a client that sees `connected`
        // is already reachable; anything sent meanwhile queues behind it.
        self.registry.add(user_id.clone(), Arc::clone(&conn));
        if !self.is_accepting() {
            // Shutdown may have snapshotted the registry before this insert.
            self.registry.remove(&user_id, conn.id());
            self.live.fetch_sub(1, Ordering::SeqCst);
            let error = HubError::ShuttingDown;
            let frame = refusal_frame(&error);
            let _ = tokio::time::timeout(CLOSE_TIMEOUT, sink.close(Some(frame))).await;
            return Err(self.reject(error));
        }

        let hello = ServerFrame::connected(
            conn.id().as_str(),
            user_id.clone(),
            PROTOCOL_VERSION,
            u32::try_from(self.config.heartbeat_interval.as_millis()).unwrap_or(u32::MAX),
        );
        let handshake = match codec::encode(&hello, encoding) {
            Ok(encoded) => tokio::select! {
                _ = conn.closed() => Err("closed during handshake".to_string()),
                sent = tokio::time::timeout(self.config.handshake_timeout, sink.send(encoded.into())) => {
                    match sent {
                        Ok(Ok(())) => Ok(()),
                        Ok(Err(e)) => Err(e.to_string()),
                        Err(_) => Err("handshake timed out".to_string()),
                    }
                }
            },
            Err(e) => Err(e.to_string()),
        };
        if let Err(reason) = handshake {
            conn.close(CloseReason::TransportError);
            self.registry.remove(&user_id, conn.id());
            self.live.fetch_sub(1, Ordering::SeqCst);
            metrics::record_upgrade_failure();
            error!(user = %user_id, connection = %conn.id(), error = %reason, "Handshake failed");
            return Err(self.reject(HubError::UpgradeFailed(reason)));
        }

        self.accepted.fetch_add(1, Ordering::Relaxed);
        metrics::record_connection();
        info!(
            user = %user_id,
            connection = %conn.id(),
            transport = name,
            encoding = encoding.as_str(),
            "Client connected"
        );

        let id = conn.id().clone();
        let registry = Arc::clone(&self.registry);
        let live = Arc::clone(&self.live);
        let settings = LoopSettings {
            write_timeout: self.config.write_timeout,
            heartbeat_interval: self.config.heartbeat_interval,
        };
        self.tasks.spawn(async move {
            let _tracked = tracked;
            let registration = Registration {
                registry,
                live,
                conn: Arc::clone(&conn),
            };
            let reason = connection::run(&conn, sink, stream, &settings).await;
            drop(registration);
            metrics::record_disconnection(reason.as_str());
            info!(
                user = %conn.user_id(),
                connection = %conn.id(),
                reason = reason.as_str(),
                "Client disconnected"
            );
        });

        Ok(id)
    }

    /// Push a notification to every connection of one user.
    ///
    /// Offline users are a no-op. Never fails; the report is for observability.
    pub fn send_to_user(
        &self,
        user_id: &UserId,
        notification: impl Into<Arc<Notification>>,
    ) -> DeliveryReport {
        self.dispatcher.route_to_user(user_id, notification.into())
    }

    /// Push a notification to every connected user.
    pub fn send_to_all(&self, notification: impl Into<Arc<Notification>>) -> DeliveryReport {
        self.dispatcher.broadcast(notification.into())
    }

    /// Route by the notification's own target: its user if set, everyone otherwise.
    pub fn send(&self, notification: impl Into<Arc<Notification>>) -> DeliveryReport {
        let notification = notification.into();
        match notification.target_user_id.clone() {
            Some(user_id) => self.send_to_user(&user_id, notification),
            None => self.send_to_all(notification),
        }
    }

    /// Users with at least one live connection, sorted.
    #[must_use]
    pub fn connected_users(&self) -> Vec<UserId> {
        let mut users: Vec<_> = self.registry.all_users().collect();
        users.sort();
        users
    }

    /// Per-connection details for one user.
    #[must_use]
    pub fn connections_for(&self, user_id: &UserId) -> Vec<ConnectionInfo> {
        let mut infos: Vec<_> = self
            .registry
            .lookup(user_id)
            .iter()
            .map(|conn| conn.info())
            .collect();
        infos.sort_by(|a, b| a.connected_at.cmp(&b.connected_at).then(a.id.cmp(&b.id)));
        infos
    }

    /// Close every connection of a user. Returns how many were closed.
    pub fn disconnect_user(&self, user_id: &UserId) -> usize {
        let closed = self
            .registry
            .lookup(user_id)
            .iter()
            .filter(|conn| conn.close(CloseReason::Kicked))
            .count();
        if closed > 0 {
            info!(user = %user_id, connections = closed, "User disconnected");
        }
        closed
    }

    /// Current statistics.
    #[must_use]
    pub fn stats(&self) -> HubStats {
        let snapshot = self.registry.snapshot();
        let totals = self.dispatcher.totals();

        HubStats {
            connection_count: snapshot.connections,
            user_count: snapshot.users,
            connections_per_user: snapshot.per_user,
            delivered: totals.delivered,
            dropped: totals.dropped,
            evicted: totals.evicted,
            failed: totals.failed,
            accepted_total: self.accepted.load(Ordering::Relaxed),
            rejected_total: self.rejected.load(Ordering::Relaxed),
            accepting: self.is_accepting(),
        }
    }

    /// Close active connections that have been silent past `client_timeout`.
    ///
    /// Returns the number of connections closed.
    pub fn reap_stale(&self) -> usize {
        let timeout = self.config.client_timeout;
        let mut reaped = 0;
        for conn in self.registry.connections() {
            if conn.is_active() && conn.idle() > timeout && conn.close(CloseReason::Stale) {
                debug!(
                    connection = %conn.id(),
                    user = %conn.user_id(),
                    idle = ?conn.idle(),
                    "Reaping stale connection"
                );
                reaped += 1;
            }
        }
        reaped
    }

    /// Start the background reaper. It stops when shutdown begins or the hub is dropped.
    pub fn spawn_maintenance(self: &Arc<Self>) -> JoinHandle<()> {
        let hub: Weak<Self> = Arc::downgrade(self);
        let shutdown = self.shutdown.clone();
        let period = self.config.reap_interval;

        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(hub) = hub.upgrade() else { break };
                        let reaped = hub.reap_stale();
                        if reaped > 0 {
                            info!(reaped, "Reaped stale connections");
                        }
                    }
                }
            }
            debug!("Maintenance task stopped");
        })
    }

    /// Stop accepting, drain every connection and wait for them to finish.
    ///
    /// Connections still open after `timeout` are force-closed, which
    /// interrupts any in-flight write, so this returns shortly after the
    /// deadline at the latest. The registry is empty on return. Calling it
    /// again is harmless.
    pub async fn shutdown(&self, timeout: Duration) -> ShutdownReport {
        if self.accepting.swap(false, Ordering::SeqCst) {
            info!(timeout = ?timeout, "Hub shutting down");
        }
        self.shutdown.cancel();

        let connections = self.registry.connections();
        let mut report = ShutdownReport {
            connections: connections.len(),
            forced: 0,
        };
        for conn in &connections {
            conn.drain();
        }
        drop(connections);

        self.tasks.close();
        if tokio::time::timeout(timeout, self.tasks.wait()).await.is_err() {
            for conn in self.registry.connections() {
                if conn.close(CloseReason::ForcedShutdown) {
                    report.forced += 1;
                }
            }
            warn!(forced = report.forced, "Drain deadline passed, force-closed connections");
            self.tasks.wait().await;
        }

        info!(
            connections = report.connections,
            forced = report.forced,
            "Hub shutdown complete"
        );
        report
    }

    async fn refuse(&self, transport: Box<dyn Transport>, error: HubError) -> HubError {
        let (mut sink, _stream) = transport.split();
        let frame = refusal_frame(&error);
        let _ = tokio::time::timeout(CLOSE_TIMEOUT, sink.close(Some(frame))).await;
        self.reject(error)
    }

    fn reject(&self, error: HubError) -> HubError {
        self.rejected.fetch_add(1, Ordering::Relaxed);
        metrics::record_rejection(match &error {
            HubError::AuthenticationRequired => "unauthenticated",
            HubError::UpgradeFailed(_) => "upgrade_failed",
            HubError::ShuttingDown => "shutting_down",
            HubError::CapacityExceeded { .. } => "capacity",
        });
        debug!(error = %error, "Connection rejected");
        error
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new(HubConfig::default())
    }
}

/// Held by a connection's supervisor; deregisters on drop, unwinding included.
struct Registration {
    registry: Arc<Registry>,
    live: Arc<AtomicUsize>,
    conn: Arc<Connection>,
}

impl Drop for Registration {
    fn drop(&mut self) {
        // No-op after a normal exit; a panicked supervisor leaves it Active.
        self.conn.close(CloseReason::TransportError);
        self.registry.remove(self.conn.user_id(), self.conn.id());
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

fn refusal_frame(error: &HubError) -> CloseFrame {
    match error {
        HubError::ShuttingDown => CloseFrame::new(CloseFrame::GOING_AWAY, "server shutdown"),
        other => CloseFrame::new(CloseFrame::POLICY, other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use herald_protocol::NotificationCategory;
    use herald_transport::memory::{self, MemoryClient};
    use herald_transport::{TransportError, TransportSink, TransportStream, WireMessage};

    fn hub_with(config: HubConfig) -> Arc<Hub> {
        Arc::new(Hub::new(config))
    }

    fn notification(title: &str) -> Notification {
        Notification::new(NotificationCategory::Shipping, title, "on its way")
    }

    async fn connect(hub: &Hub, user: &str, buffer: usize) -> (ConnectionId, MemoryClient) {
        let (transport, mut client) = memory::pair(buffer);
        let id = hub
            .accept(Some(UserId::new(user)), Box::new(transport), Encoding::Json)
            .await
            .unwrap();
        match next_frame(&mut client).await {
            ServerFrame::Connected { user_id, .. } => assert_eq!(user_id.as_str(), user),
            other => panic!("expected connected frame, got {:?}", other),
        }
        (id, client)
    }

    async fn next_frame(client: &mut MemoryClient) -> ServerFrame {
        loop {
            match client.recv().await {
                Some(WireMessage::Text(text)) => match serde_json::from_str(&text).unwrap() {
                    ServerFrame::Ping { .. } => continue,
                    frame => return frame,
                },
                Some(WireMessage::Ping(_)) => continue,
                other => panic!("unexpected message {:?}", other),
            }
        }
    }

    async fn next_title(client: &mut MemoryClient) -> String {
        match next_frame(client).await {
            ServerFrame::Notification { notification } => notification.title.clone(),
            other => panic!("expected notification, got {:?}", other),
        }
    }

    async fn wait_for_empty(hub: &Hub) {
        for _ in 0..100 {
            if hub.registry().is_empty() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("registry still holds {:?}", hub.registry().count());
    }

    /// Transport whose writes never complete.
    struct StalledTransport;

    struct StalledSink;

    struct IdleStream;

    impl Transport for StalledTransport {
        fn name(&self) -> &'static str {
            "stalled"
        }

        fn split(self: Box<Self>) -> (Box<dyn TransportSink>, Box<dyn TransportStream>) {
            (Box::new(StalledSink), Box::new(IdleStream))
        }
    }

    #[async_trait]
    impl TransportSink for StalledSink {
        async fn send(&mut self, _message: WireMessage) -> Result<(), TransportError> {
            std::future::pending().await
        }

        async fn close(&mut self, _frame: Option<CloseFrame>) -> Result<(), TransportError> {
            Ok(())
        }
    }

    #[async_trait]
    impl TransportStream for IdleStream {
        async fn recv(&mut self) -> Result<Option<WireMessage>, TransportError> {
            std::future::pending().await
        }
    }

    /// Transport whose reads panic, taking the supervisor down with them.
    struct PanickingTransport {
        inner: memory::MemoryTransport,
    }

    struct PanickingStream;

    impl Transport for PanickingTransport {
        fn name(&self) -> &'static str {
            "panicking"
        }

        fn split(self: Box<Self>) -> (Box<dyn TransportSink>, Box<dyn TransportStream>) {
            let (sink, _stream) = Box::new(self.inner).split();
            (sink, Box::new(PanickingStream))
        }
    }

    #[async_trait]
    impl TransportStream for PanickingStream {
        async fn recv(&mut self) -> Result<Option<WireMessage>, TransportError> {
            panic!("transport read failed hard")
        }
    }

    #[tokio::test]
    async fn test_connected_frame_reports_heartbeat_millis() {
        let hub = hub_with(HubConfig::default());
        let (transport, mut client) = memory::pair(4);
        hub.accept(Some(UserId::new("u")), Box::new(transport), Encoding::Json)
            .await
            .unwrap();

        match next_frame(&mut client).await {
            ServerFrame::Connected { heartbeat, .. } => assert_eq!(heartbeat, 30_000),
            other => panic!("expected connected frame, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_zero_intervals_do_not_break_connections() {
        let hub = hub_with(HubConfig {
            heartbeat_interval: Duration::ZERO,
            reap_interval: Duration::ZERO,
            ..HubConfig::default()
        });
        assert_eq!(hub.config().heartbeat_interval, HubConfig::MIN_INTERVAL);
        let maintenance = hub.spawn_maintenance();

        let (transport, _client) = memory::pair(1024);
        hub.accept(Some(UserId::new("u")), Box::new(transport), Encoding::Json)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(hub.registry().count(), (1, 1));

        let report = hub.shutdown(Duration::from_millis(100)).await;
        assert_eq!(report.connections, 1);
        assert!(hub.registry().is_empty());
        assert_eq!(hub.stats().connection_count, 0);
        maintenance.await.unwrap();
    }

    #[tokio::test]
    async fn test_panicking_supervisor_still_deregisters() {
        let hub = hub_with(HubConfig::default());
        let (inner, mut client) = memory::pair(4);
        hub.accept(
            Some(UserId::new("u")),
            Box::new(PanickingTransport { inner }),
            Encoding::Json,
        )
        .await
        .unwrap();
        assert!(matches!(next_frame(&mut client).await, ServerFrame::Connected { .. }));

        wait_for_empty(&hub).await;
        let report = hub.shutdown(Duration::from_millis(100)).await;
        assert_eq!(report.connections, 0);
        assert_eq!(report.forced, 0);
        assert_eq!(hub.stats().connection_count, 0);
    }

    #[tokio::test]
    async fn test_send_to_user_multi_device() {
        let hub = hub_with(HubConfig::default());
        let user = UserId::new("u");
        let (c1, mut client1) = connect(&hub, "u", 8).await;
        let (_c2, mut client2) = connect(&hub, "u", 8).await;

        let report = hub.send_to_user(&user, notification("n"));
        assert_eq!(report.delivered, 2);
        assert_eq!(next_title(&mut client1).await, "n");
        assert_eq!(next_title(&mut client2).await, "n");

        assert!(hub.registry().remove(&user, &c1).is_some());
        let report = hub.send_to_user(&user, notification("n2"));
        assert_eq!(report.attempted, 1);
        assert_eq!(next_title(&mut client2).await, "n2");

        tokio::task::yield_now().await;
        assert!(client1.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_send_to_unknown_user_is_noop() {
        let hub = hub_with(HubConfig::default());
        let _conn = connect(&hub, "someone", 4).await;

        let report = hub.send_to_user(&UserId::new("nobody"), notification("x"));
        assert_eq!(report.attempted, 0);
        assert_eq!(hub.stats().delivered, 0);
    }

    #[tokio::test]
    async fn test_broadcast_one_attempt_per_connection() {
        let hub = hub_with(HubConfig::default());
        let mut clients = Vec::new();
        for i in 0..5 {
            clients.push(connect(&hub, &format!("user-{i}"), 8).await.1);
        }

        let report = hub.send_to_all(notification("sale"));
        assert_eq!(report.users, 5);
        assert_eq!(report.attempted, 5);

        for client in &mut clients {
            assert_eq!(next_title(client).await, "sale");
        }
    }

    #[tokio::test]
    async fn test_send_routes_by_target() {
        let hub = hub_with(HubConfig::default());
        let (_a, mut alice) = connect(&hub, "alice", 8).await;
        let (_b, mut bob) = connect(&hub, "bob", 8).await;

        hub.send(notification("for alice").for_user("alice"));
        hub.send(notification("for everyone"));

        assert_eq!(next_title(&mut alice).await, "for alice");
        assert_eq!(next_title(&mut alice).await, "for everyone");
        assert_eq!(next_title(&mut bob).await, "for everyone");
    }

    #[tokio::test]
    async fn test_accept_requires_identity() {
        let hub = hub_with(HubConfig::default());
        let (transport, mut client) = memory::pair(4);

        let result = hub.accept(None, Box::new(transport), Encoding::Json).await;
        assert!(matches!(result, Err(HubError::AuthenticationRequired)));
        match client.recv().await {
            Some(WireMessage::Close(Some(frame))) => assert_eq!(frame.code, CloseFrame::POLICY),
            other => panic!("expected close frame, got {:?}", other),
        }
        assert!(matches!(
            hub.check_admission(None),
            Err(HubError::AuthenticationRequired)
        ));
        assert_eq!(hub.stats().rejected_total, 2);
    }

    #[tokio::test]
    async fn test_connection_limit() {
        let hub = hub_with(HubConfig {
            max_connections: 1,
            ..HubConfig::default()
        });
        let _first = connect(&hub, "u1", 4).await;

        let (transport, _client) = memory::pair(4);
        let result = hub
            .accept(Some(UserId::new("u2")), Box::new(transport), Encoding::Json)
            .await;
        assert!(matches!(result, Err(HubError::CapacityExceeded { limit: 1 })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_timeout_fails_upgrade() {
        let hub = hub_with(HubConfig {
            handshake_timeout: Duration::from_secs(2),
            ..HubConfig::default()
        });

        let result = hub
            .accept(Some(UserId::new("u")), Box::new(StalledTransport), Encoding::Json)
            .await;
        assert!(matches!(result, Err(HubError::UpgradeFailed(_))));
        assert!(hub.registry().is_empty());
    }

    #[tokio::test]
    async fn test_client_close_deregisters() {
        let hub = hub_with(HubConfig::default());
        let (_id, mut client) = connect(&hub, "u", 4).await;
        assert_eq!(hub.connected_users(), vec![UserId::new("u")]);

        client.hang_up();
        wait_for_empty(&hub).await;
        assert!(hub.connected_users().is_empty());
        assert_eq!(hub.stats().accepted_total, 1);
    }

    #[tokio::test]
    async fn test_disconnect_user() {
        let hub = hub_with(HubConfig::default());
        let (_a, mut first) = connect(&hub, "u", 4).await;
        let (_b, _second) = connect(&hub, "u", 4).await;
        assert_eq!(hub.connections_for(&UserId::new("u")).len(), 2);

        assert_eq!(hub.disconnect_user(&UserId::new("u")), 2);
        wait_for_empty(&hub).await;

        match first.recv().await {
            Some(WireMessage::Close(Some(frame))) => assert_eq!(frame.code, CloseFrame::POLICY),
            other => panic!("expected close frame, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_bounded_queue_drop_newest() {
        let hub = hub_with(HubConfig {
            queue_capacity: 2,
            ..HubConfig::default()
        });
        let user = UserId::new("u");
        let conn = Arc::new(Connection::new(ConnectionId::new("c"), user.clone(), 2));
        hub.registry().add(user.clone(), Arc::clone(&conn));

        for title in ["first", "second", "third"] {
            hub.send_to_user(&user, notification(title));
        }

        assert_eq!(conn.queue_len(), 2);
        let stats = hub.stats();
        assert_eq!(stats.delivered, 2);
        assert_eq!(stats.dropped, 1);
    }

    #[tokio::test]
    async fn test_stats_histogram() {
        let hub = hub_with(HubConfig::default());
        let _a = connect(&hub, "alice", 4).await;
        let _b = connect(&hub, "alice", 4).await;
        let _c = connect(&hub, "bob", 4).await;

        let stats = hub.stats();
        assert_eq!(stats.connection_count, 3);
        assert_eq!(stats.user_count, 2);
        assert_eq!(stats.connections_per_user.get(&2), Some(&1));
        assert_eq!(stats.connections_per_user.get(&1), Some(&1));
        assert!(stats.accepting);
    }

    #[tokio::test(start_paused = true)]
    async fn test_maintenance_reaps_stale_connections() {
        let hub = hub_with(HubConfig {
            client_timeout: Duration::from_secs(60),
            reap_interval: Duration::from_secs(15),
            heartbeat_interval: Duration::from_secs(30),
            ..HubConfig::default()
        });
        let maintenance = hub.spawn_maintenance();
        let (_id, _client) = connect(&hub, "sleepy", 16).await;

        tokio::time::sleep(Duration::from_secs(90)).await;
        wait_for_empty(&hub).await;

        hub.shutdown(Duration::from_secs(1)).await;
        maintenance.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_active_client_is_not_reaped() {
        let hub = hub_with(HubConfig {
            client_timeout: Duration::from_secs(60),
            ..HubConfig::default()
        });
        let (_id, client) = connect(&hub, "chatty", 16).await;

        for _ in 0..4 {
            tokio::time::sleep(Duration::from_secs(30)).await;
            client
                .send(WireMessage::Text(r#"{"type":"pong"}"#.into()))
                .await
                .unwrap();
            tokio::task::yield_now().await;
            assert_eq!(hub.reap_stale(), 0);
        }
    }

    #[tokio::test]
    async fn test_shutdown_drains_queued_notifications() {
        let hub = hub_with(HubConfig::default());
        let user = UserId::new("u");
        let (_id, mut client) = connect(&hub, "u", 16).await;

        hub.send_to_user(&user, notification("last words"));
        let report = hub.shutdown(Duration::from_secs(5)).await;

        assert_eq!(report.connections, 1);
        assert_eq!(report.forced, 0);
        assert!(hub.registry().is_empty());

        assert_eq!(next_title(&mut client).await, "last words");
        match client.recv().await {
            Some(WireMessage::Close(Some(frame))) => assert_eq!(frame.code, CloseFrame::GOING_AWAY),
            other => panic!("expected close frame, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_force_closes_stuck_writer() {
        let hub = hub_with(HubConfig {
            write_timeout: Duration::from_secs(3600),
            ..HubConfig::default()
        });
        let user = UserId::new("stuck");
        // One slot: the handshake frame fills it and the client never reads.
        let (transport, _client) = memory::pair(1);
        hub.accept(Some(user.clone()), Box::new(transport), Encoding::Json)
            .await
            .unwrap();
        hub.send_to_user(&user, notification("never written"));
        tokio::task::yield_now().await;

        let started = tokio::time::Instant::now();
        let report = hub.shutdown(Duration::from_secs(2)).await;

        assert!(started.elapsed() < Duration::from_secs(3));
        assert_eq!(report.forced, 1);
        assert!(hub.registry().is_empty());
    }

    #[tokio::test]
    async fn test_accept_after_shutdown() {
        let hub = hub_with(HubConfig::default());
        hub.shutdown(Duration::from_millis(10)).await;
        assert!(!hub.is_accepting());

        let (transport, _client) = memory::pair(4);
        let result = hub
            .accept(Some(UserId::new("late")), Box::new(transport), Encoding::Json)
            .await;
        assert!(matches!(result, Err(HubError::ShuttingDown)));

        // Idempotent.
        assert_eq!(hub.shutdown(Duration::from_millis(10)).await, ShutdownReport::default());
    }

    #[tokio::test]
    async fn test_msgpack_connection() {
        let hub = hub_with(HubConfig::default());
        let (transport, mut client) = memory::pair(8);
        hub.accept(Some(UserId::new("bin")), Box::new(transport), Encoding::MessagePack)
            .await
            .unwrap();

        match client.recv().await {
            Some(WireMessage::Binary(data)) => {
                let frame: ServerFrame = codec::decode_msgpack(&data).unwrap();
                assert_eq!(frame.kind(), "connected");
            }
            other => panic!("expected binary frame, got {:?}", other),
        }
    }

    #[test]
    fn test_refusal_frame() {
        assert_eq!(
            refusal_frame(&HubError::ShuttingDown).code,
            CloseFrame::GOING_AWAY
        );
        assert_eq!(
            refusal_frame(&HubError::AuthenticationRequired).code,
            CloseFrame::POLICY
        );
    }
}
