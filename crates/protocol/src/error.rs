//! Protocol error types

use thiserror::Error;

/// Protocol result type
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Protocol error types
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Buffer too short: need {need} bytes, have {have}")]
    BufferTooShort { need: usize, have: usize },

    #[error("Unknown signal kind: {0}")]
    UnknownSignalKind(u8),

    #[error("Frame too large: {got} bytes exceeds limit {limit}")]
    FrameTooLarge { got: usize, limit: usize },

    #[error("Payload length mismatch: header says {expected}, decoded {got}")]
    PayloadLengthMismatch { expected: usize, got: usize },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
