//! Backend error types

use thiserror::Error;

/// Backend result type
pub type Result<T> = std::result::Result<T, BackendError>;

/// Backend error types
#[derive(Debug, Error)]
pub enum BackendError {
    /// No free space in the KV cache. `offset` is the index of the first
    /// batch entry that failed; the scheduler halves the micro-batch and
    /// retries from there.
    #[error("No free space in the KV cache (failed at batch offset {offset})")]
    KvFull { offset: usize },

    #[error("Accelerator {0} not compiled in")]
    AccelUnavailable(&'static str),

    #[error("Activation width {got} does not match hidden_dim {expected}")]
    BadActivationWidth { expected: usize, got: usize },

    #[error("KV error: {0}")]
    Kv(#[from] ringlm_kv::KvError),

    #[error("Model error: {0}")]
    Model(#[from] ringlm_model::ModelError),

    #[cfg(feature = "cuda")]
    #[error("CUDA error: {0}")]
    Cuda(String),
}
