//! Model shape configuration

use serde::{Deserialize, Serialize};

use crate::error::{ModelError, Result};

/// Model shape, carried in the artifact manifest and in the bring-up
/// handshake so every rank agrees on tensor dimensions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Number of transformer layers
    pub n_layers: usize,
    /// Activation width
    pub hidden_dim: usize,
    /// Vocabulary size
    pub vocab_size: usize,
    /// Context length the model was trained with
    pub n_ctx_train: usize,
    /// Seed baked into the artifact's weight tiles
    pub weight_seed: u64,
}

impl ModelConfig {
    /// Validate dimensions before use
    pub fn validate(&self) -> Result<()> {
        if self.n_layers == 0 {
            return Err(ModelError::Config("n_layers must be positive".into()));
        }
        if self.hidden_dim == 0 {
            return Err(ModelError::Config("hidden_dim must be positive".into()));
        }
        if self.vocab_size == 0 {
            return Err(ModelError::Config("vocab_size must be positive".into()));
        }
        Ok(())
    }

    /// Bytes of one weight tile: a scale vector and a shift vector
    pub fn tile_bytes(&self) -> usize {
        self.hidden_dim * 2 * std::mem::size_of::<f32>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_rejects_zero_layers() {
        let config = ModelConfig {
            n_layers: 0,
            hidden_dim: 64,
            vocab_size: 260,
            n_ctx_train: 2048,
            weight_seed: 1,
        };
        assert!(config.validate().is_err());
    }
}
