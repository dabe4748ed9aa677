//! Engine error types

use thiserror::Error;

/// Engine result type
pub type Result<T> = std::result::Result<T, EngineError>;

/// Engine error types
#[derive(Debug, Error)]
pub enum EngineError {
    /// KV cache exhausted at `offset` within the submitted batch. The
    /// scheduler halves the micro-batch and retries from there.
    #[error("No free space in the KV cache (batch offset {offset})")]
    KvFull { offset: usize },

    #[error("Ring stopped")]
    Stopped,

    #[error("Rank {rank} has no window for cycle {cycle}")]
    NoWindow { rank: usize, cycle: u32 },

    #[error("Backend error: {0}")]
    Backend(ringlm_backend::BackendError),

    #[error("Ring error: {0}")]
    Ring(#[from] ringlm_ring::RingError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ringlm_protocol::ProtocolError),

    #[error("Model error: {0}")]
    Model(#[from] ringlm_model::ModelError),

    #[error("KV error: {0}")]
    Kv(#[from] ringlm_kv::KvError),
}

impl From<ringlm_backend::BackendError> for EngineError {
    fn from(err: ringlm_backend::BackendError) -> Self {
        match err {
            ringlm_backend::BackendError::KvFull { offset } => EngineError::KvFull { offset },
            other => EngineError::Backend(other),
        }
    }
}
