//! WebSocket transport implementation.
//!
//! Adapts an upgraded axum [`WebSocket`] to the [`Transport`] traits.

use async_trait::async_trait;
use axum::extract::ws::{self, Message, WebSocket};
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::borrow::Cow;
use std::net::SocketAddr;
use tracing::{debug, trace};

use crate::traits::{CloseFrame, Transport, TransportError, TransportSink, TransportStream, WireMessage};

/// An upgraded WebSocket session.
pub struct WebSocketTransport {
    socket: WebSocket,
    remote_addr: Option<SocketAddr>,
}

impl WebSocketTransport {
    /// Wrap an upgraded socket.
    #[must_use]
    pub fn new(socket: WebSocket, remote_addr: Option<SocketAddr>) -> Self {
        Self {
            socket,
            remote_addr,
        }
    }
}

impl Transport for WebSocketTransport {
    fn name(&self) -> &'static str {
        "websocket"
    }

    fn remote_addr(&self) -> Option<String> {
        self.remote_addr.map(|a| a.to_string())
    }

    fn split(self: Box<Self>) -> (Box<dyn TransportSink>, Box<dyn TransportStream>) {
        let (sink, stream) = self.socket.split();
        (
            Box::new(WebSocketSink { sink }),
            Box::new(WebSocketStream { stream }),
        )
    }
}

/// Outbound half of a [`WebSocketTransport`].
pub struct WebSocketSink {
    sink: SplitSink<WebSocket, Message>,
}

#[async_trait]
impl TransportSink for WebSocketSink {
    async fn send(&mut self, message: WireMessage) -> Result<(), TransportError> {
        self.sink
            .send(to_axum(message))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn close(&mut self, frame: Option<CloseFrame>) -> Result<(), TransportError> {
        // The peer may already be gone; a failed close frame is not an error.
        if let Err(e) = self.sink.send(to_axum(WireMessage::Close(frame))).await {
            trace!(error = %e, "Close frame not delivered");
        }
        self.sink
            .close()
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }
}

/// Inbound half of a [`WebSocketTransport`].
pub struct WebSocketStream {
    stream: SplitStream<WebSocket>,
}

#[async_trait]
impl TransportStream for WebSocketStream {
    async fn recv(&mut self) -> Result<Option<WireMessage>, TransportError> {
        match self.stream.next().await {
            Some(Ok(message)) => Ok(Some(from_axum(message))),
            Some(Err(e)) => {
                debug!(error = %e, "WebSocket receive error");
                Err(TransportError::ReceiveFailed(e.to_string()))
            }
            None => Ok(None),
        }
    }
}

fn to_axum(message: WireMessage) -> Message {
    match message {
        WireMessage::Text(text) => Message::Text(text),
        WireMessage::Binary(data) => Message::Binary(data.to_vec()),
        WireMessage::Ping(data) => Message::Ping(data.to_vec()),
        WireMessage::Pong(data) => Message::Pong(data.to_vec()),
        WireMessage::Close(frame) => Message::Close(frame.map(|f| ws::CloseFrame {
            code: f.code,
            reason: Cow::Owned(f.reason),
        })),
    }
}

fn from_axum(message: Message) -> WireMessage {
    match message {
        Message::Text(text) => WireMessage::Text(text),
        Message::Binary(data) => WireMessage::Binary(Bytes::from(data)),
        Message::Ping(data) => WireMessage::Ping(Bytes::from(data)),
        Message::Pong(data) => WireMessage::Pong(Bytes::from(data)),
        Message::Close(frame) => WireMessage::Close(frame.map(|f| CloseFrame {
            code: f.code,
            reason: f.reason.into_owned(),
        })),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_conversion() {
        let close = WireMessage::Close(Some(CloseFrame::new(CloseFrame::GOING_AWAY, "shutdown")));
        assert_eq!(from_axum(to_axum(close.clone())), close);

        let text = WireMessage::Text("hello".to_string());
        assert_eq!(from_axum(to_axum(text.clone())), text);

        let binary = WireMessage::Binary(Bytes::from_static(b"\x00\x01"));
        assert_eq!(from_axum(to_axum(binary.clone())), binary);
    }
}
