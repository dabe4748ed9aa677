//! Ring transport error types

use thiserror::Error;

/// Ring result type
pub type Result<T> = std::result::Result<T, RingError>;

/// Ring error types. Transport failures are fatal: the pipeline stops via
/// `STOP`, there is no retry.
#[derive(Debug, Error)]
pub enum RingError {
    #[error("Protocol error: {0}")]
    Protocol(#[from] ringlm_protocol::ProtocolError),

    #[error("KV error: {0}")]
    Kv(#[from] ringlm_kv::KvError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Bring-up failed: {0}")]
    BringUp(String),

    #[error("Ring stopped")]
    Stopped,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
