//! Error types for the protocol crate.

use thiserror::Error;

/// Protocol error type covering all wire-level failure modes.
#[derive(Debug, Error)]
pub enum ProtocolError {
    // Serialization errors
    /// Failed to serialize data.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Failed to deserialize data.
    #[error("deserialization failed: {0}")]
    Deserialization(String),

    // Frame errors
    /// Frame or message exceeds the maximum allowed size.
    #[error("frame too large: {size} bytes exceeds maximum of {max} bytes")]
    FrameTooLarge {
        /// Actual size.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },

    /// The frame kind byte is not one of the known kinds.
    #[error("unknown frame kind: {0}")]
    UnknownFrameKind(u8),

    /// A resize or exit payload has the wrong shape.
    #[error("invalid {kind} payload: expected {expected} bytes, got {got}")]
    InvalidPayload {
        /// Frame kind name.
        kind: &'static str,
        /// Expected payload length.
        expected: usize,
        /// Actual payload length.
        got: usize,
    },

    // Connection errors
    /// Connection was closed unexpectedly.
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    /// Operation timed out.
    #[error("operation timed out: {0}")]
    Timeout(String),

    /// Any other transport failure.
    #[error("transport error: {0}")]
    Transport(String),
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_eof() || err.is_syntax() {
            ProtocolError::Deserialization(err.to_string())
        } else {
            ProtocolError::Serialization(err.to_string())
        }
    }
}

impl From<std::io::Error> for ProtocolError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::TimedOut => ProtocolError::Timeout(err.to_string()),
            ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof => ProtocolError::ConnectionClosed(err.to_string()),
            _ => ProtocolError::Transport(err.to_string()),
        }
    }
}
