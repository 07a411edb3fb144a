//! Live client connections.
//!
//! A [`Connection`] owns a bounded FIFO of pending notifications and is driven
//! by two loops sharing one cancellation token:
//!
//! - the **reader** observes inbound frames, client close and app-level pings
//! - the **writer** drains the queue to the transport in order, emits
//!   heartbeats and flushes on drain
//!
//! Whichever loop stops first closes the connection, which cancels the other.

use chrono::{DateTime, Utc};
use herald_protocol::{codec, error_codes, ClientFrame, Encoding, Notification, ServerFrame, UserId};
use herald_transport::{CloseFrame, ConnectionId, TransportSink, TransportStream, WireMessage};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::error::DeliveryError;
use crate::metrics;

/// Capacity of the reader → writer control channel (pongs, error notices).
const CONTROL_CAPACITY: usize = 16;

/// Time allowed for the close handshake after a graceful stop.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum ConnectionState {
    /// Accepting and delivering notifications.
    Active = 0,
    /// Refusing new notifications while flushing queued ones.
    Draining = 1,
    /// Terminal.
    Closed = 2,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::Active,
            1 => ConnectionState::Draining,
            _ => ConnectionState::Closed,
        }
    }
}

/// Why a connection was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// The client sent a close frame or hung up.
    ClientClosed,
    /// Reading from or writing to the transport failed.
    TransportError,
    /// A single write exceeded the write timeout.
    WriteTimeout,
    /// No inbound traffic within the client timeout.
    Stale,
    /// The queue overflowed under the close-connection policy.
    Overflow,
    /// Disconnected on request (e.g. account suspended).
    Kicked,
    /// Drained during server shutdown.
    Shutdown,
    /// Still open when the shutdown deadline passed.
    ForcedShutdown,
}

impl CloseReason {
    /// Name used in logs and metric labels.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::ClientClosed => "client_closed",
            CloseReason::TransportError => "transport_error",
            CloseReason::WriteTimeout => "write_timeout",
            CloseReason::Stale => "stale",
            CloseReason::Overflow => "overflow",
            CloseReason::Kicked => "kicked",
            CloseReason::Shutdown => "shutdown",
            CloseReason::ForcedShutdown => "forced_shutdown",
        }
    }

    /// Close frame to send, or `None` when the peer cannot or need not get one.
    #[must_use]
    pub fn close_frame(&self) -> Option<CloseFrame> {
        match self {
            CloseReason::ClientClosed => Some(CloseFrame::new(CloseFrame::NORMAL, "bye")),
            CloseReason::Stale => Some(CloseFrame::new(CloseFrame::POLICY, "heartbeat timeout")),
            CloseReason::Overflow => Some(CloseFrame::new(CloseFrame::POLICY, "too slow")),
            CloseReason::Kicked => Some(CloseFrame::new(CloseFrame::POLICY, "disconnected")),
            CloseReason::Shutdown => Some(CloseFrame::new(CloseFrame::GOING_AWAY, "server shutdown")),
            CloseReason::TransportError | CloseReason::WriteTimeout | CloseReason::ForcedShutdown => {
                None
            }
        }
    }
}

/// Serializable snapshot of a connection for admin views.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub id: String,
    pub user_id: UserId,
    pub state: ConnectionState,
    pub transport: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_addr: Option<String>,
    pub encoding: &'static str,
    pub connected_at: DateTime<Utc>,
    pub idle_ms: u64,
    pub queue_len: usize,
    pub queue_capacity: usize,
}

/// Settings the connection loops run with.
#[derive(Debug, Clone)]
pub struct LoopSettings {
    /// Time allowed for a single transport write.
    pub write_timeout: Duration,
    /// Interval between heartbeat pings.
    pub heartbeat_interval: Duration,
}

/// A live client connection bound to one user.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    user_id: UserId,
    encoding: Encoding,
    transport: &'static str,
    remote_addr: Option<String>,
    capacity: usize,
    queue: Mutex<VecDeque<Arc<Notification>>>,
    state: AtomicU8,
    close_reason: OnceLock<CloseReason>,
    wakeup: Notify,
    cancel: CancellationToken,
    connected_at: DateTime<Utc>,
    started: Instant,
    /// Milliseconds after `started` of the last inbound message.
    last_seen_ms: AtomicU64,
}

impl Connection {
    /// Create an active connection with a queue bound of `capacity`.
    #[must_use]
    pub fn new(id: ConnectionId, user_id: UserId, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            id,
            user_id,
            encoding: Encoding::default(),
            transport: "unknown",
            remote_addr: None,
            capacity,
            queue: Mutex::new(VecDeque::with_capacity(capacity.min(64))),
            state: AtomicU8::new(ConnectionState::Active as u8),
            close_reason: OnceLock::new(),
            wakeup: Notify::new(),
            cancel: CancellationToken::new(),
            connected_at: Utc::now(),
            started: Instant::now(),
            last_seen_ms: AtomicU64::new(0),
        }
    }

    /// Set the wire encoding used by the writer.
    #[must_use]
    pub fn with_encoding(mut self, encoding: Encoding) -> Self {
        self.encoding = encoding;
        self
    }

    /// Record which transport carries this connection.
    #[must_use]
    pub fn with_transport(mut self, name: &'static str, remote_addr: Option<String>) -> Self {
        self.transport = name;
        self.remote_addr = remote_addr;
        self
    }

    /// Get the connection ID.
    #[must_use]
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// Get the owning user.
    #[must_use]
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// Get the wire encoding.
    #[must_use]
    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    /// Get the current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Check if the connection still accepts notifications.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state() == ConnectionState::Active
    }

    /// Why the connection closed, once it has.
    #[must_use]
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason.get().copied()
    }

    /// Number of queued notifications.
    #[must_use]
    pub fn queue_len(&self) -> usize {
        self.queue.lock().len()
    }

    /// Queue bound.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Try to queue a notification without waiting.
    ///
    /// # Errors
    ///
    /// [`DeliveryError::Dropped`] if the queue is full,
    /// [`DeliveryError::ConnectionClosed`] if the connection is draining or closed.
    pub fn try_enqueue(&self, notification: Arc<Notification>) -> Result<(), DeliveryError> {
        {
            let mut queue = self.queue.lock();
            if !self.is_active() {
                return Err(DeliveryError::ConnectionClosed);
            }
            if queue.len() >= self.capacity {
                return Err(DeliveryError::Dropped);
            }
            queue.push_back(notification);
        }
        self.wakeup.notify_one();
        Ok(())
    }

    /// Queue a notification; `false` if it was not accepted.
    pub fn enqueue(&self, notification: Arc<Notification>) -> bool {
        self.try_enqueue(notification).is_ok()
    }

    /// Queue a notification, evicting the oldest one if the queue is full.
    ///
    /// Returns the evicted notification, if any.
    ///
    /// # Errors
    ///
    /// [`DeliveryError::ConnectionClosed`] if the connection is draining or closed.
    pub fn enqueue_displacing(
        &self,
        notification: Arc<Notification>,
    ) -> Result<Option<Arc<Notification>>, DeliveryError> {
        let evicted = {
            let mut queue = self.queue.lock();
            if !self.is_active() {
                return Err(DeliveryError::ConnectionClosed);
            }
            let evicted = if queue.len() >= self.capacity {
                queue.pop_front()
            } else {
                None
            };
            queue.push_back(notification);
            evicted
        };
        self.wakeup.notify_one();
        Ok(evicted)
    }

    fn pop(&self) -> Option<Arc<Notification>> {
        self.queue.lock().pop_front()
    }

    /// Stop accepting notifications and let the writer flush what is queued.
    ///
    /// Returns `true` if this call moved the connection out of `Active`.
    pub fn drain(&self) -> bool {
        let moved = {
            let _queue = self.queue.lock();
            self.state
                .compare_exchange(
                    ConnectionState::Active as u8,
                    ConnectionState::Draining as u8,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                )
                .is_ok()
        };
        if moved {
            debug!(connection = %self.id, user = %self.user_id, "Draining connection");
            self.wakeup.notify_one();
        }
        moved
    }

    /// Close the connection. Idempotent.
    ///
    /// Discards queued notifications and cancels both loops. Returns `true`
    /// only for the call that performed the transition.
    pub fn close(&self, reason: CloseReason) -> bool {
        let previous = {
            let mut queue = self.queue.lock();
            let previous = self.state.swap(ConnectionState::Closed as u8, Ordering::SeqCst);
            if previous != ConnectionState::Closed as u8 {
                queue.clear();
            }
            previous
        };
        if previous == ConnectionState::Closed as u8 {
            return false;
        }

        let _ = self.close_reason.set(reason);
        self.cancel.cancel();
        self.wakeup.notify_one();
        debug!(
            connection = %self.id,
            user = %self.user_id,
            reason = reason.as_str(),
            "Connection closed"
        );
        true
    }

    /// Record inbound activity.
    pub fn touch(&self) {
        let elapsed = u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.last_seen_ms.fetch_max(elapsed, Ordering::Relaxed);
    }

    /// Time since the last inbound message (or since connecting).
    #[must_use]
    pub fn idle(&self) -> Duration {
        let last_seen = Duration::from_millis(self.last_seen_ms.load(Ordering::Relaxed));
        self.started.elapsed().saturating_sub(last_seen)
    }

    /// Snapshot for admin views.
    #[must_use]
    pub fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            id: self.id.to_string(),
            user_id: self.user_id.clone(),
            state: self.state(),
            transport: self.transport,
            remote_addr: self.remote_addr.clone(),
            encoding: self.encoding.as_str(),
            connected_at: self.connected_at,
            idle_ms: u64::try_from(self.idle().as_millis()).unwrap_or(u64::MAX),
            queue_len: self.queue_len(),
            queue_capacity: self.capacity,
        }
    }

    /// Resolves once the connection is closed.
    pub async fn closed(&self) {
        self.cancel.cancelled().await;
    }

    fn stop_reason(&self) -> CloseReason {
        self.close_reason().unwrap_or(CloseReason::Shutdown)
    }
}

/// Drive a registered connection until it closes.
///
/// Runs the reader and writer concurrently, then performs the close handshake
/// when the stop was graceful. Returns the close reason; the caller owns
/// deregistration.
pub async fn run(
    conn: &Connection,
    mut sink: Box<dyn TransportSink>,
    mut stream: Box<dyn TransportStream>,
    settings: &LoopSettings,
) -> CloseReason {
    let (control_tx, mut control_rx) = mpsc::channel(CONTROL_CAPACITY);

    let reader = async {
        let reason = read_loop(conn, stream.as_mut(), control_tx).await;
        conn.close(reason);
    };
    let writer = async {
        let reason = write_loop(conn, sink.as_mut(), &mut control_rx, settings).await;
        conn.close(reason);
    };
    tokio::join!(reader, writer);
    drop(stream);

    let reason = conn.stop_reason();
    if let Some(frame) = reason.close_frame() {
        if tokio::time::timeout(CLOSE_TIMEOUT, sink.close(Some(frame)))
            .await
            .is_err()
        {
            trace!(connection = %conn.id, "Close handshake timed out");
        }
    }
    reason
}

async fn read_loop(
    conn: &Connection,
    stream: &mut dyn TransportStream,
    control: mpsc::Sender<ServerFrame>,
) -> CloseReason {
    loop {
        let received = tokio::select! {
            biased;
            _ = conn.cancel.cancelled() => return conn.stop_reason(),
            received = stream.recv() => received,
        };

        let message = match received {
            Ok(Some(message)) => message,
            Ok(None) => {
                debug!(connection = %conn.id, "Transport stream ended");
                return CloseReason::ClientClosed;
            }
            Err(e) => {
                debug!(connection = %conn.id, error = %e, "Transport receive error");
                return CloseReason::TransportError;
            }
        };

        conn.touch();
        let decoded = match message {
            WireMessage::Text(text) => codec::decode_text(&text),
            WireMessage::Binary(data) => codec::decode_binary(&data),
            // Transport-level keepalives only refresh liveness.
            WireMessage::Ping(_) | WireMessage::Pong(_) => continue,
            WireMessage::Close(_) => {
                debug!(connection = %conn.id, "Received close frame");
                return CloseReason::ClientClosed;
            }
        };

        let reply = match decoded {
            Ok(ClientFrame::Ping { timestamp }) => Some(ServerFrame::pong(timestamp)),
            Ok(ClientFrame::Pong { .. }) => None,
            Ok(ClientFrame::Ack { id }) => {
                trace!(connection = %conn.id, notification = %id, "Client acknowledged");
                None
            }
            Err(e) => {
                debug!(connection = %conn.id, error = %e, "Malformed client frame");
                Some(ServerFrame::error(error_codes::MALFORMED_FRAME, e.to_string()))
            }
        };

        if let Some(frame) = reply {
            // Control replies are best-effort like everything else.
            if control.try_send(frame).is_err() {
                trace!(connection = %conn.id, "Control channel full, reply dropped");
            }
        }
    }
}

async fn write_loop(
    conn: &Connection,
    sink: &mut dyn TransportSink,
    control: &mut mpsc::Receiver<ServerFrame>,
    settings: &LoopSettings,
) -> CloseReason {
    let mut heartbeat = tokio::time::interval_at(
        Instant::now() + settings.heartbeat_interval,
        settings.heartbeat_interval,
    );
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        if let Err(reason) = flush(conn, sink, settings).await {
            return reason;
        }

        match conn.state() {
            ConnectionState::Active => {}
            ConnectionState::Draining => {
                // Nothing can be enqueued any more; one last pass catches racing writes.
                return match flush(conn, sink, settings).await {
                    Ok(()) => CloseReason::Shutdown,
                    Err(reason) => reason,
                };
            }
            ConnectionState::Closed => return conn.stop_reason(),
        }

        let outcome = tokio::select! {
            biased;
            _ = conn.cancel.cancelled() => return conn.stop_reason(),
            _ = conn.wakeup.notified() => Ok(()),
            Some(frame) = control.recv() => write_frame(conn, sink, &frame, settings).await,
            _ = heartbeat.tick() => {
                let millis = u64::try_from(Utc::now().timestamp_millis()).ok();
                write_frame(conn, sink, &ServerFrame::ping(millis), settings).await
            }
        };
        if let Err(reason) = outcome {
            return reason;
        }
    }
}

async fn flush(
    conn: &Connection,
    sink: &mut dyn TransportSink,
    settings: &LoopSettings,
) -> Result<(), CloseReason> {
    while let Some(notification) = conn.pop() {
        let frame = ServerFrame::notification(notification);
        write_frame(conn, sink, &frame, settings).await?;
    }
    Ok(())
}

async fn write_frame(
    conn: &Connection,
    sink: &mut dyn TransportSink,
    frame: &ServerFrame,
    settings: &LoopSettings,
) -> Result<(), CloseReason> {
    match codec::encode(frame, conn.encoding) {
        Ok(encoded) => write_message(conn, sink, encoded.into(), settings).await,
        Err(e) => {
            // One unencodable frame must not take the connection down.
            warn!(connection = %conn.id, kind = frame.kind(), error = %e, "Failed to encode frame");
            metrics::record_deliveries("failed", 1);
            Ok(())
        }
    }
}

async fn write_message(
    conn: &Connection,
    sink: &mut dyn TransportSink,
    message: WireMessage,
    settings: &LoopSettings,
) -> Result<(), CloseReason> {
    let start = Instant::now();
    tokio::select! {
        biased;
        _ = conn.cancel.cancelled() => Err(conn.stop_reason()),
        sent = tokio::time::timeout(settings.write_timeout, sink.send(message)) => match sent {
            Ok(Ok(())) => {
                metrics::record_write_latency(start.elapsed().as_secs_f64());
                Ok(())
            }
            Ok(Err(e)) => {
                debug!(connection = %conn.id, error = %e, "Transport write failed");
                Err(CloseReason::TransportError)
            }
            Err(_) => {
                warn!(connection = %conn.id, timeout = ?settings.write_timeout, "Transport write timed out");
                Err(CloseReason::WriteTimeout)
            }
        },
    }
}
