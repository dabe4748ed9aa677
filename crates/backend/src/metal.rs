//! Metal variant
//!
//! Apple GPUs share the host address space, so tiles prefetched into the
//! page cache are already visible to the accelerator; there is no staging
//! copy. The arithmetic runs through the shared reference path over the
//! mapped pages.

use half::f16;
use metal::Device;
use ringlm_kv::KvCache;
use ringlm_model::ModelConfig;

use crate::batch::BatchEntry;
use crate::error::{BackendError, Result};
use crate::reference;

/// Metal backend: unified-memory device handle
pub struct MetalBackend {
    config: ModelConfig,
    device: Device,
}

impl MetalBackend {
    pub fn new(config: ModelConfig) -> Result<Self> {
        let device = Device::system_default()
            .ok_or(BackendError::AccelUnavailable("metal"))?;
        tracing::info!(
            name = %device.name(),
            working_set = device.recommended_max_working_set_size(),
            "Metal device initialised"
        );
        Ok(Self { config, device })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// VRAM budget reported by the device, shared with host memory
    pub fn working_set_bytes(&self) -> u64 {
        self.device.recommended_max_working_set_size()
    }

    pub fn step_layer(
        &self,
        tile: &[u8],
        activations: &mut [f16],
        entries: &[BatchEntry],
        kv: &mut KvCache,
        local_layer: usize,
    ) -> Result<()> {
        reference::layer_forward(&self.config, tile, activations, entries, kv, local_layer)
    }
}
