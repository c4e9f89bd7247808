//! JSON text framing for tether envelopes.
//!
//! One envelope per WebSocket text frame. The transport already delimits
//! frames, so unlike a byte-stream codec there is no length prefix.

use crate::error::{TetherError, TetherResult};

/// Largest frame accepted from any peer (1 MiB).
pub const MAX_FRAME_SIZE: usize = 1_048_576;

/// Encode an envelope into a JSON text frame.
pub fn encode<T: serde::Serialize>(value: &T) -> TetherResult<String> {
    serde_json::to_string(value).map_err(|e| TetherError::Other(format!("encode failed: {e}")))
}

/// Decode a JSON text frame into a typed envelope.
///
/// Oversized frames, invalid JSON and unknown `type` values all surface as
/// [`TetherError::Protocol`], so callers can drop the one message and carry on.
pub fn decode<T: serde::de::DeserializeOwned>(text: &str) -> TetherResult<T> {
    if text.len() > MAX_FRAME_SIZE {
        return Err(TetherError::Protocol(format!(
            "frame too large: {} bytes (max {MAX_FRAME_SIZE})",
            text.len()
        )));
    }
    Ok(serde_json::from_str(text)?)
}

/// Best-effort peek at the `type` field, for logging rejected frames.
pub fn peek_type(text: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(text).ok()?;
    value.get("type")?.as_str().map(str::to_string)
}
