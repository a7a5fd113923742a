//! Codec for encoding and decoding envelopes.
//!
//! Envelopes travel as JSON text frames. Decoding enforces a frame-size
//! bound so an oversized frame is a typed error the connection layer can
//! treat as fatal for that connection, never a process crash.

use crate::envelope::Envelope;

/// Default maximum inbound frame size (512 KiB, sized for base64 images).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 512 * 1024;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Frame exceeds the configured maximum size.
    #[error("frame size {size} exceeds maximum {max}")]
    FrameTooLarge { size: usize, max: usize },

    /// JSON encoding/decoding error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Encode an envelope to its wire form.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn encode(envelope: &Envelope) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(envelope)?)
}

/// Decode an envelope from a wire frame, enforcing `max_size`.
///
/// # Errors
///
/// Returns an error if the frame is oversized or not a valid envelope.
pub fn decode(frame: &str, max_size: usize) -> Result<Envelope, ProtocolError> {
    if frame.len() > max_size {
        return Err(ProtocolError::FrameTooLarge {
            size: frame.len(),
            max: max_size,
        });
    }
    Ok(serde_json::from_str(frame)?)
}
