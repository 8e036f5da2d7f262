//! Serialization and deserialization for the meshchat wire protocol.
//!
//! Provides encode/decode functions using postcard, along with
//! length-prefix framing variants for stream-based transports. The
//! functions are generic so the same framing carries both [`Envelope`]s
//! and the link handshake.
//!
//! [`Envelope`]: crate::message::Envelope

use serde::Serialize;
use serde::de::DeserializeOwned;

/// Size of the little-endian length prefix in front of each frame.
pub const FRAME_HEADER_LEN: usize = 4;

/// Largest payload a frame may announce (16 MiB).
///
/// A file chunk is 1 MiB, so this leaves ample headroom while refusing
/// absurd lengths from a corrupted prefix.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Error type for codec encode/decode operations.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),
    /// Frame is incomplete or has an invalid length prefix.
    #[error("invalid frame: {0}")]
    InvalidFrame(String),
}

/// Encodes a value into a byte vector using postcard.
///
/// # Errors
///
/// Returns `CodecError::Serialization` if the value cannot be serialized.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
    postcard::to_allocvec(value).map_err(|e| CodecError::Serialization(e.to_string()))
}

/// Decodes a value from a byte slice using postcard.
///
/// Unknown enum variants surface as `CodecError::Serialization`, so the
/// caller can log and skip them.
///
/// # Errors
///
/// Returns `CodecError::Serialization` if the bytes cannot be deserialized.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    postcard::from_bytes(bytes).map_err(|e| CodecError::Serialization(e.to_string()))
}

/// Encodes a value with a 4-byte little-endian length prefix.
///
/// Wire format: `[u32 length (LE)][payload bytes]`
///
/// # Errors
///
/// Returns `CodecError::Serialization` if the value cannot be serialized,
/// or `CodecError::InvalidFrame` if the payload exceeds [`MAX_FRAME_SIZE`].
pub fn encode_framed<T: Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
    let payload = encode(value)?;
    let len = frame_len(payload.len())?;
    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Decodes a length-prefixed frame back into a value.
///
/// Returns the decoded value and the total number of bytes consumed
/// from the input (including the 4-byte length prefix).
///
/// # Errors
///
/// Returns `CodecError::InvalidFrame` if the input is too short or the
/// length prefix is out of range, or `CodecError::Serialization` if the
/// payload cannot be deserialized.
pub fn decode_framed<T: DeserializeOwned>(bytes: &[u8]) -> Result<(T, usize), CodecError> {
    let payload_len = read_frame_len(bytes)?;
    let total_len = FRAME_HEADER_LEN + payload_len;
    if bytes.len() < total_len {
        return Err(CodecError::InvalidFrame(format!(
            "frame indicates {} bytes but only {} available",
            payload_len,
            bytes.len() - FRAME_HEADER_LEN
        )));
    }

    let value = decode(&bytes[FRAME_HEADER_LEN..total_len])?;
    Ok((value, total_len))
}

/// Reads and validates the payload length from a frame header.
///
/// Stream readers call this on the first [`FRAME_HEADER_LEN`] bytes to
/// learn how much more to read.
///
/// # Errors
///
/// Returns `CodecError::InvalidFrame` if fewer than four bytes are given
/// or the announced length exceeds [`MAX_FRAME_SIZE`].
pub fn read_frame_len(bytes: &[u8]) -> Result<usize, CodecError> {
    let header: [u8; FRAME_HEADER_LEN] = bytes
        .get(..FRAME_HEADER_LEN)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| {
            CodecError::InvalidFrame(format!(
                "need at least 4 bytes for length prefix, got {}",
                bytes.len()
            ))
        })?;
    let len = u32::from_le_bytes(header) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(CodecError::InvalidFrame(format!(
            "frame length {len} exceeds maximum {MAX_FRAME_SIZE}"
        )));
    }
    Ok(len)
}

fn frame_len(payload_len: usize) -> Result<u32, CodecError> {
    if payload_len > MAX_FRAME_SIZE {
        return Err(CodecError::InvalidFrame(format!(
            "payload too large for framing: {payload_len} bytes"
        )));
    }
    u32::try_from(payload_len).map_err(|_| {
        CodecError::InvalidFrame(format!("payload too large for framing: {payload_len} bytes"))
    })
}
