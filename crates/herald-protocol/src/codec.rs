//! Codec for encoding and decoding Herald frames.
//!
//! Two encodings are supported per connection:
//! - JSON, sent as WebSocket text messages (the default)
//! - MessagePack with a length prefix, sent as binary messages

use bytes::{BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::str::FromStr;
use thiserror::Error;

use crate::frames::{ClientFrame, ServerFrame};

/// Maximum frame size (1 MiB).
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Length prefix size in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds maximum size.
    #[error("Frame size {0} exceeds maximum {MAX_FRAME_SIZE}")]
    FrameTooLarge(usize),

    /// Not enough data to decode frame.
    #[error("Incomplete frame: need {0} more bytes")]
    Incomplete(usize),

    /// MessagePack encoding error.
    #[error("Encoding error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// MessagePack decoding error.
    #[error("Decoding error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// JSON error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Payload of the wrong kind for the negotiated encoding.
    #[error("Invalid frame: {0}")]
    Invalid(String),
}

/// Wire encoding negotiated for a connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Encoding {
    /// JSON text messages.
    #[default]
    Json,
    /// Length-prefixed MessagePack binary messages.
    MessagePack,
}

impl Encoding {
    /// Name used in query strings and logs.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Encoding::Json => "json",
            Encoding::MessagePack => "msgpack",
        }
    }
}

impl FromStr for Encoding {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(Encoding::Json),
            "msgpack" | "messagepack" => Ok(Encoding::MessagePack),
            other => Err(ProtocolError::Invalid(format!("unknown encoding: {other}"))),
        }
    }
}

/// An encoded frame ready to hand to a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Encoded {
    /// UTF-8 text message.
    Text(String),
    /// Binary message.
    Binary(Bytes),
}

impl Encoded {
    /// Size of the encoded payload in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Encoded::Text(s) => s.len(),
            Encoded::Binary(b) => b.len(),
        }
    }

    /// Check if the payload is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Encode a server frame with the given encoding.
///
/// # Errors
///
/// Returns an error if the frame is too large or serialization fails.
pub fn encode(frame: &ServerFrame, encoding: Encoding) -> Result<Encoded, ProtocolError> {
    match encoding {
        Encoding::Json => {
            let text = serde_json::to_string(frame)?;
            if text.len() > MAX_FRAME_SIZE {
                return Err(ProtocolError::FrameTooLarge(text.len()));
            }
            Ok(Encoded::Text(text))
        }
        Encoding::MessagePack => encode_msgpack(frame).map(Encoded::Binary),
    }
}

/// Decode a client frame received as a text message.
///
/// # Errors
///
/// Returns an error if the text is not a valid JSON client frame.
pub fn decode_text(text: &str) -> Result<ClientFrame, ProtocolError> {
    if text.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(text.len()));
    }
    Ok(serde_json::from_str(text)?)
}

/// Decode a client frame received as a binary message.
///
/// # Errors
///
/// Returns an error if the data is incomplete, too large, or invalid.
pub fn decode_binary(data: &[u8]) -> Result<ClientFrame, ProtocolError> {
    decode_msgpack(data)
}

/// Encode any serializable value as a length-prefixed MessagePack frame.
///
/// The encoded format is:
/// - 4 bytes: Big-endian length prefix
/// - N bytes: MessagePack-encoded value (named fields)
///
/// # Errors
///
/// Returns an error if the value is too large or encoding fails.
pub fn encode_msgpack<T: Serialize + ?Sized>(value: &T) -> Result<Bytes, ProtocolError> {
    let payload = rmp_serde::to_vec_named(value)?;

    if payload.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(payload.len()));
    }

    let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.extend_from_slice(&payload);

    Ok(buf.freeze())
}

/// Decode a length-prefixed MessagePack frame.
///
/// # Errors
///
/// Returns an error if the data is incomplete, too large, or invalid.
pub fn decode_msgpack<T: DeserializeOwned>(data: &[u8]) -> Result<T, ProtocolError> {
    let length = read_length(data)?;
    let total_size = LENGTH_PREFIX_SIZE + length;
    let body = data
        .get(LENGTH_PREFIX_SIZE..total_size)
        .ok_or(ProtocolError::Incomplete(total_size.saturating_sub(data.len())))?;

    Ok(rmp_serde::from_slice(body)?)
}

fn read_length(data: &[u8]) -> Result<usize, ProtocolError> {
    let prefix: [u8; LENGTH_PREFIX_SIZE] = data
        .get(..LENGTH_PREFIX_SIZE)
        .and_then(|p| p.try_into().ok())
        .ok_or(ProtocolError::Incomplete(LENGTH_PREFIX_SIZE.saturating_sub(data.len())))?;
    let length = u32::from_be_bytes(prefix) as usize;

    if length > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(length));
    }
    Ok(length)
}
