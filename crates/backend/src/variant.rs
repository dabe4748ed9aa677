//! Accelerator variants and dispatch
//!
//! A closed tagged enum, selected once at process start. Every variant
//! shares the reference math; the GPU variants additionally manage device
//! residency for their offloaded layer prefix.

use half::f16;
use ringlm_kv::KvCache;
use ringlm_model::{ModelConfig, WeightStore};

use crate::batch::{Batch, BatchEntry, ComputeOutcome, LogitsRow};
use crate::error::{BackendError, Result};
use crate::reference;

/// Accelerator selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Accel {
    /// Host CPU
    #[default]
    Cpu,
    /// Discrete NVIDIA GPU via CUDA
    Cuda,
    /// Apple GPU via Metal (unified memory)
    Metal,
    /// No accelerator; compute still runs on the CPU, no layers offload
    None,
}

impl Accel {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "cpu" => Some(Accel::Cpu),
            "cuda" => Some(Accel::Cuda),
            "metal" => Some(Accel::Metal),
            "none" => Some(Accel::None),
            _ => None,
        }
    }

    /// Whether prefetched host pages are directly visible to the
    /// accelerator
    pub fn has_uma(self) -> bool {
        matches!(self, Accel::Metal)
    }
}

impl std::fmt::Display for Accel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Accel::Cpu => "cpu",
            Accel::Cuda => "cuda",
            Accel::Metal => "metal",
            Accel::None => "none",
        };
        f.write_str(s)
    }
}

/// The compute backend for one node
pub enum Backend {
    Cpu { config: ModelConfig },
    #[cfg(feature = "cuda")]
    Cuda(crate::cuda::CudaBackend),
    #[cfg(all(feature = "metal", target_os = "macos"))]
    Metal(crate::metal::MetalBackend),
}

impl Backend {
    /// Select a variant at process start. GPU variants fall back to an
    /// error when their feature is not compiled in.
    pub fn new(accel: Accel, config: ModelConfig) -> Result<Self> {
        match accel {
            Accel::Cpu | Accel::None => Ok(Backend::Cpu { config }),
            Accel::Cuda => {
                #[cfg(feature = "cuda")]
                {
                    Ok(Backend::Cuda(crate::cuda::CudaBackend::new(config)?))
                }
                #[cfg(not(feature = "cuda"))]
                {
                    Err(BackendError::AccelUnavailable("cuda"))
                }
            }
            Accel::Metal => {
                #[cfg(all(feature = "metal", target_os = "macos"))]
                {
                    Ok(Backend::Metal(crate::metal::MetalBackend::new(config)?))
                }
                #[cfg(not(all(feature = "metal", target_os = "macos")))]
                {
                    let _ = &config;
                    Err(BackendError::AccelUnavailable("metal"))
                }
            }
        }
    }

    /// The variant in use
    pub fn accel(&self) -> Accel {
        match self {
            Backend::Cpu { .. } => Accel::Cpu,
            #[cfg(feature = "cuda")]
            Backend::Cuda(_) => Accel::Cuda,
            #[cfg(all(feature = "metal", target_os = "macos"))]
            Backend::Metal(_) => Accel::Metal,
        }
    }

    /// Model shape
    pub fn config(&self) -> &ModelConfig {
        match self {
            Backend::Cpu { config } => config,
            #[cfg(feature = "cuda")]
            Backend::Cuda(b) => b.config(),
            #[cfg(all(feature = "metal", target_os = "macos"))]
            Backend::Metal(b) => b.config(),
        }
    }

    /// Embed a micro-batch into activation rows (head only)
    pub fn embed(&self, batch: &Batch) -> Vec<f16> {
        let config = self.config();
        batch
            .entries
            .iter()
            .flat_map(|e| reference::embed_token(config, e.token))
            .collect()
    }

    /// Run one layer of this node's window over the batch, in place.
    ///
    /// `tile` must be the layer's weight tile; `local_layer` indexes the
    /// node's KV shard.
    pub fn step_layer(
        &self,
        tile: &[u8],
        activations: &mut [f16],
        entries: &[BatchEntry],
        kv: &mut KvCache,
        local_layer: usize,
    ) -> Result<()> {
        match self {
            Backend::Cpu { config } => {
                reference::layer_forward(config, tile, activations, entries, kv, local_layer)
            }
            #[cfg(feature = "cuda")]
            Backend::Cuda(b) => b.step_layer(tile, activations, entries, kv, local_layer),
            #[cfg(all(feature = "metal", target_os = "macos"))]
            Backend::Metal(b) => b.step_layer(tile, activations, entries, kv, local_layer),
        }
    }

    /// Stage a node's GPU-offloaded layer prefix in device memory.
    /// Host-only variants and unified-memory devices have nothing to
    /// copy: their mapped pages are the working copy.
    pub fn preload_layers(&self, store: &WeightStore, layers: &[u32]) -> Result<()> {
        match self {
            Backend::Cpu { .. } => {
                let _ = (store, layers);
                Ok(())
            }
            #[cfg(feature = "cuda")]
            Backend::Cuda(b) => {
                for &layer in layers {
                    b.preload_layer(layer as usize, store.address(layer as usize)?)?;
                }
                Ok(())
            }
            #[cfg(all(feature = "metal", target_os = "macos"))]
            Backend::Metal(_) => Ok(()),
        }
    }

    /// Project one final activation row onto the vocabulary
    pub fn project(&self, row: &[f16]) -> Vec<f32> {
        reference::project_logits(self.config(), row)
    }

    /// Project flagged entries onto the vocabulary (head, last cycle)
    pub fn logits(&self, activations: &[f16], entries: &[BatchEntry]) -> Vec<LogitsRow> {
        let config = self.config();
        let d = config.hidden_dim;
        entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.logits)
            .map(|(i, _)| LogitsRow {
                index: i,
                values: reference::project_logits(config, &activations[i * d..(i + 1) * d]),
            })
            .collect()
    }

    /// Decode a batch against a locally-complete model: embed, run every
    /// layer, project. Used by the single-node path and the draft model.
    pub fn decode_local(
        &self,
        store: &WeightStore,
        batch: &Batch,
        kv: &mut KvCache,
    ) -> Result<ComputeOutcome> {
        let mut activations = self.embed(batch);
        for layer in 0..self.config().n_layers {
            let tile = store.address(layer)?;
            self.step_layer(tile, &mut activations, &batch.entries, kv, layer)?;
        }
        Ok(ComputeOutcome::Logits(
            self.logits(&activations, &batch.entries),
        ))
    }
}
