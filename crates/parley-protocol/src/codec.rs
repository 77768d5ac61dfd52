//! Codec for Parley messages.
//!
//! Messages arrive in one of two encodings: serialized JSON text, or a
//! structured MessagePack map with the same field names. Outbound messages
//! are always JSON. The raw socket transport additionally wraps each message
//! in a length-prefixed frame.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::message::Message;

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

    /// JSON encoding or decoding error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// MessagePack decoding error.
    #[error("MessagePack error: {0}")]
    MessagePack(#[from] rmp_serde::decode::Error),

    /// Invalid message data.
    #[error("Invalid message: {0}")]
    Invalid(String),
}

/// Parse a message from serialized JSON text.
///
/// # Errors
///
/// Returns an error if the text is not a valid message object.
pub fn parse_text(text: &str) -> Result<Message, ProtocolError> {
    Ok(serde_json::from_str(text)?)
}

/// Parse a message from bytes, detecting the encoding.
///
/// Data whose first non-whitespace byte is `{` is treated as JSON text,
/// anything else as a MessagePack map.
///
/// # Errors
///
/// Returns an error if the data is empty or cannot be decoded.
pub fn parse(data: &[u8]) -> Result<Message, ProtocolError> {
    match data.iter().find(|b| !b.is_ascii_whitespace()) {
        None => Err(ProtocolError::Invalid("empty message".into())),
        Some(b'{') => Ok(serde_json::from_slice(data)?),
        Some(_) => Ok(rmp_serde::from_slice(data)?),
    }
}

/// Serialize a message to JSON text.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn to_text(message: &Message) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(message)?)
}

/// Encode a message as a length-prefixed JSON frame.
///
/// The encoded format is:
/// - 4 bytes: Big-endian length prefix
/// - N bytes: JSON-encoded message
///
/// # Errors
///
/// Returns an error if the message is too large or encoding fails.
pub fn encode(message: &Message) -> Result<Bytes, ProtocolError> {
    let payload = serde_json::to_vec(message)?;
    encode_frame(&payload)
}

/// Wrap an already-encoded payload in a length-prefixed frame.
///
/// # Errors
///
/// Returns an error if the payload exceeds [`MAX_FRAME_SIZE`].
pub fn encode_frame(payload: &[u8]) -> Result<Bytes, ProtocolError> {
    if payload.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(payload.len()));
    }

    let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.extend_from_slice(payload);

    Ok(buf.freeze())
}

/// Try to take one frame payload from a buffer, advancing it if successful.
///
/// Returns `Ok(Some(payload))` if a complete frame was available,
/// `Ok(None)` if more data is needed, or `Err` if the declared length is
/// larger than `max_size`.
///
/// # Errors
///
/// Returns an error if the frame is too large.
pub fn decode_from(buf: &mut BytesMut, max_size: usize) -> Result<Option<Bytes>, ProtocolError> {
    if buf.len() < LENGTH_PREFIX_SIZE {
        return Ok(None);
    }

    let length = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;

    if length > max_size.min(MAX_FRAME_SIZE) {
        return Err(ProtocolError::FrameTooLarge(length));
    }

    let total_size = LENGTH_PREFIX_SIZE + length;
    if buf.len() < total_size {
        buf.reserve(total_size - buf.len());
        return Ok(None);
    }

    buf.advance(LENGTH_PREFIX_SIZE);
    Ok(Some(buf.split_to(length).freeze()))
}
