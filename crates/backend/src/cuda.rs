//! CUDA variant
//!
//! Manages device residency for the node's GPU-offloaded layer prefix. The
//! arithmetic itself still runs through the shared reference path on host
//! memory; device buffers hold the offloaded tiles so the planner's VRAM
//! accounting is real.
//! TODO: swap the host math for fused kernels once the kernel crate lands.

use std::collections::HashMap;
use std::sync::Arc;

use cudarc::driver::{CudaDevice, CudaSlice};
use parking_lot::RwLock;
use half::f16;
use ringlm_kv::KvCache;
use ringlm_model::ModelConfig;

use crate::batch::BatchEntry;
use crate::error::{BackendError, Result};
use crate::reference;

/// CUDA backend: device handle plus resident tile buffers
pub struct CudaBackend {
    config: ModelConfig,
    device: Arc<CudaDevice>,
    resident: RwLock<HashMap<usize, CudaSlice<u8>>>,
}

impl CudaBackend {
    pub fn new(config: ModelConfig) -> Result<Self> {
        let device =
            CudaDevice::new(0).map_err(|e| BackendError::Cuda(e.to_string()))?;
        tracing::info!(ordinal = 0, "CUDA device initialised");
        Ok(Self {
            config,
            device,
            resident: RwLock::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Stage a layer's tile in VRAM
    pub fn preload_layer(&self, layer: usize, tile: &[u8]) -> Result<()> {
        let slice = self
            .device
            .htod_sync_copy(tile)
            .map_err(|e| BackendError::Cuda(e.to_string()))?;
        self.resident.write().insert(layer, slice);
        Ok(())
    }

    /// Whether a layer's tile is VRAM-resident
    pub fn is_resident(&self, layer: usize) -> bool {
        self.resident.read().contains_key(&layer)
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
