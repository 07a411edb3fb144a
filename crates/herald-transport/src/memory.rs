//! In-process transport.
//!
//! [`pair`] returns a server-side [`MemoryTransport`] and the client end
//! driving it. Both directions are bounded channels, so a client that stops
//! reading applies real backpressure to the server's writer.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;

use crate::traits::{CloseFrame, Transport, TransportError, TransportSink, TransportStream, WireMessage};

/// Create a connected transport/client pair.
///
/// `buffer` is the number of messages each direction holds before the sender
/// has to wait.
#[must_use]
pub fn pair(buffer: usize) -> (MemoryTransport, MemoryClient) {
    let (to_client, client_rx) = mpsc::channel(buffer.max(1));
    let (client_tx, from_client) = mpsc::channel(buffer.max(1));

    (
        MemoryTransport {
            to_client,
            from_client,
        },
        MemoryClient {
            tx: Some(client_tx),
            rx: client_rx,
        },
    )
}

/// Server side of an in-memory session.
#[derive(Debug)]
pub struct MemoryTransport {
    to_client: mpsc::Sender<WireMessage>,
    from_client: mpsc::Receiver<WireMessage>,
}

impl Transport for MemoryTransport {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn split(self: Box<Self>) -> (Box<dyn TransportSink>, Box<dyn TransportStream>) {
        (
            Box::new(MemorySink {
                tx: Some(self.to_client),
            }),
            Box::new(MemoryStream {
                rx: self.from_client,
            }),
        )
    }
}

struct MemorySink {
    tx: Option<mpsc::Sender<WireMessage>>,
}

#[async_trait]
impl TransportSink for MemorySink {
    async fn send(&mut self, message: WireMessage) -> Result<(), TransportError> {
        let tx = self.tx.as_ref().ok_or(TransportError::ConnectionClosed)?;
        tx.send(message)
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }

    async fn close(&mut self, frame: Option<CloseFrame>) -> Result<(), TransportError> {
        if let Some(tx) = self.tx.take() {
            // Never wait on a client that stopped reading.
            let _ = tx.try_send(WireMessage::Close(frame));
        }
        Ok(())
    }
}

struct MemoryStream {
    rx: mpsc::Receiver<WireMessage>,
}

#[async_trait]
impl TransportStream for MemoryStream {
    async fn recv(&mut self) -> Result<Option<WireMessage>, TransportError> {
        Ok(self.rx.recv().await)
    }
}

/// Client side of an in-memory session.
#[derive(Debug)]
pub struct MemoryClient {
    tx: Option<mpsc::Sender<WireMessage>>,
    rx: mpsc::Receiver<WireMessage>,
}

impl MemoryClient {
    /// Send a message to the server.
    ///
    /// # Errors
    ///
    /// Returns an error if the server side is gone or the client hung up.
    pub async fn send(&self, message: WireMessage) -> Result<(), TransportError> {
        let tx = self.tx.as_ref().ok_or(TransportError::ConnectionClosed)?;
        tx.send(message)
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }

    /// Wait for the next message from the server.
    ///
    /// Returns `None` once the server side has dropped its sink.
    pub async fn recv(&mut self) -> Option<WireMessage> {
        self.rx.recv().await
    }

    /// Take a message if one is already queued.
    pub fn try_recv(&mut self) -> Option<WireMessage> {
        match self.rx.try_recv() {
            Ok(message) => Some(message),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }

    /// Hang up: the server's stream observes end-of-stream.
    pub fn hang_up(&mut self) {
        self.tx = None;
    }
}
