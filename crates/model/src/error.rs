//! Model loading error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid artifact: {0}")]
    InvalidFormat(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Layer {layer} out of range, model has {n_layers} layers")]
    LayerOutOfRange { layer: usize, n_layers: usize },

    #[error("Tile for layer {layer} extends past the mapped file")]
    TileOutOfBounds { layer: usize },

    #[error("Model config error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, ModelError>;
