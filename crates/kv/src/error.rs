//! KV cache error types

use thiserror::Error;

/// KV result type
pub type Result<T> = std::result::Result<T, KvError>;

/// KV cache error types
#[derive(Debug, Error)]
pub enum KvError {
    #[error("No free space in the KV cache for sequence {seq}")]
    Full { seq: u32 },

    #[error("Layer {layer} out of range, cache holds {n_layers} layers")]
    LayerOutOfRange { layer: usize, n_layers: usize },

    #[error("Invalid mutation: {0}")]
    InvalidMutation(String),

    #[error("Invalid sequence file: {0}")]
    InvalidFile(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
