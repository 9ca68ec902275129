//! JSON encoding and decoding for realtime frames.
//!
//! Frames are single JSON text messages. Decoding enforces a maximum frame
//! size before parsing and distinguishes an unknown `type` tag from a
//! structurally invalid frame so callers can log them differently.

use serde::Serialize;
use serde::de::DeserializeOwned;

/// Default upper bound for a single frame, in bytes (64 KB).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 64 * 1024;

/// Error type for codec encode/decode operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    /// Serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),
    /// The frame parsed as JSON but its `type` tag is not recognized.
    #[error("unknown frame type: {0}")]
    UnknownType(String),
    /// The frame exceeds the configured size limit.
    #[error("frame too large ({size} bytes, max {max} bytes)")]
    Oversized {
        /// Actual size of the frame in bytes.
        size: usize,
        /// Maximum allowed size in bytes.
        max: usize,
    },
}

/// Encodes a frame as a JSON string.
///
/// # Errors
///
/// Returns `CodecError::Serialization` if the value cannot be serialized.
pub fn encode<T: Serialize>(frame: &T) -> Result<String, CodecError> {
    serde_json::to_string(frame).map_err(|e| CodecError::Serialization(e.to_string()))
}

/// Decodes a frame, rejecting input larger than [`DEFAULT_MAX_FRAME_SIZE`].
///
/// # Errors
///
/// See [`decode_bounded`].
pub fn decode<T: DeserializeOwned>(text: &str) -> Result<T, CodecError> {
    decode_bounded(text, DEFAULT_MAX_FRAME_SIZE)
}

/// Decodes a frame, rejecting input larger than `max` bytes.
///
/// # Errors
///
/// Returns `CodecError::Oversized` if `text` exceeds `max`,
/// `CodecError::UnknownType` if the `type` tag is not a known variant, or
/// `CodecError::Serialization` for any other malformed input.
pub fn decode_bounded<T: DeserializeOwned>(text: &str, max: usize) -> Result<T, CodecError> {
    if text.len() > max {
        return Err(CodecError::Oversized {
            size: text.len(),
            max,
        });
    }
    serde_json::from_str(text).map_err(|e| classify(text, &e))
}

fn classify(text: &str, err: &serde_json::Error) -> CodecError {
    if err.is_data()
        && let Ok(value) = serde_json::from_str::<serde_json::Value>(text)
        && let Some(tag) = value.get("type").and_then(serde_json::Value::as_str)
        && err.to_string().starts_with("unknown variant")
    {
        return CodecError::UnknownType(tag.to_owned());
    }
    CodecError::Serialization(err.to_string())
}
