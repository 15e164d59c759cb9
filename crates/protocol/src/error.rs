//! Error types for the protocol crate.

use thiserror::Error;

/// Protocol error type covering all possible failure modes.
///
/// Every variant is fatal: the session routes it through `destroy` and emits
/// no further callbacks afterwards.
#[derive(Debug, Error)]
pub enum ProtocolError {
    // Handshake errors
    /// Noise handshake failed (bad MAC, malformed message, wrong pattern step).
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// The remote peer completed the handshake without attaching a payload.
    #[error("remote peer did not attach a handshake payload")]
    MissingRemotePayload,

    /// The remote handshake payload could not be decoded.
    #[error("invalid remote handshake payload: {0}")]
    BadRemotePayload(String),

    // Frame errors
    /// A varint was longer than 10 bytes or exceeded the 53-bit bound.
    #[error("invalid varint")]
    InvalidVarint,

    /// Frame exceeds maximum allowed size.
    #[error("frame too large: {size} bytes exceeds maximum of {max} bytes")]
    FrameTooLarge {
        /// Actual frame size.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },

    /// Channel number does not fit in the frame header.
    #[error("channel {0} out of range")]
    ChannelTooLarge(u64),

    /// Frame header carried a type number with no registered schema.
    #[error("unknown message type: {0}")]
    UnknownType(u8),

    /// A known message type failed to decode.
    #[error("failed to decode {0} message: {1}")]
    Decode(&'static str, String),

    // Session errors
    /// More sends were queued before the handshake than the session allows.
    #[error("pending queue overflow: too many messages sent before handshake completion")]
    PendingOverflow,
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

impl From<snow::Error> for ProtocolError {
    fn from(err: snow::Error) -> Self {
        ProtocolError::Handshake(err.to_string())
    }
}
