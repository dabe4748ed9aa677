//! Per-node engine state shared by head and workers

use half::f16;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::thread::JoinHandle;

use ringlm_backend::{Backend, BatchEntry};
use ringlm_kv::KvCache;
use ringlm_model::{ModelConfig, WeightStore};
use ringlm_planner::Assignment;
use ringlm_ring::SharedQueue;

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};

/// Shared per-node engine state: the store, the KV shard, this node's
/// traversal order over its layers, and the prefetch/release bookkeeping.
pub struct NodeCore {
    pub config: EngineConfig,
    pub model: ModelConfig,
    pub assignment: Assignment,
    pub rank: usize,
    pub backend: Backend,
    pub store: Arc<WeightStore>,
    pub kv: Arc<Mutex<KvCache>>,
    /// This node's layers in traversal order (cycle-major)
    node_layers: Vec<u32>,
    /// Global layer -> index into `node_layers` (also the KV shard index)
    local_index: HashMap<u32, usize>,
    /// In-flight references per owned tile, indexed like `node_layers`
    tile_refs: Mutex<Vec<u32>>,
    /// Prefetch-issued flags, indexed like `node_layers`
    requested: Mutex<Vec<bool>>,
    /// Feed to the prefetch thread; `None` when prefetch is off
    prefetch_queue: Option<Arc<SharedQueue<usize>>>,
    prefetch_thread: Option<JoinHandle<()>>,
}

impl NodeCore {
    /// Build the per-node state and, when enabled, start the prefetch
    /// thread.
    pub fn new(
        config: EngineConfig,
        assignment: Assignment,
        rank: usize,
        backend: Backend,
        store: Arc<WeightStore>,
        n_ctx_slot: usize,
    ) -> Self {
        let model = backend.config().clone();
        let node_layers: Vec<u32> = assignment
            .windows_for(rank)
            .iter()
            .flat_map(|w| w.begin..w.end)
            .collect();
        let local_index: HashMap<u32, usize> = node_layers
            .iter()
            .enumerate()
            .map(|(i, &layer)| (layer, i))
            .collect();

        let kv = Arc::new(Mutex::new(KvCache::new(
            node_layers.len(),
            n_ctx_slot,
            model.hidden_dim,
        )));

        // the VRAM-resident prefix of this node's share
        let gpu_count = assignment
            .gpu_layers
            .get(rank)
            .copied()
            .unwrap_or(0)
            .min(node_layers.len() as u32) as usize;
        if gpu_count > 0 {
            if let Err(e) = backend.preload_layers(&store, &node_layers[..gpu_count]) {
                tracing::warn!(error = %e, "GPU preload failed, staying host-resident");
            }
        }

        let (prefetch_queue, prefetch_thread) = if config.prefetch {
            let queue: Arc<SharedQueue<usize>> = Arc::new(SharedQueue::new(64));
            let thread = {
                let queue = queue.clone();
                let store = store.clone();
                std::thread::Builder::new()
                    .name("engine-prefetch".into())
                    .spawn(move || {
                        while let Some(layer) = queue.pop() {
                            if let Err(e) = store.prefetch(layer) {
                                tracing::warn!(layer, error = %e, "prefetch failed");
                            }
                        }
                    })
                    .expect("spawn engine-prefetch")
            };
            (Some(queue), Some(thread))
        } else {
            (None, None)
        };

        Self {
            tile_refs: Mutex::new(vec![0; node_layers.len()]),
            requested: Mutex::new(vec![false; node_layers.len()]),
            config,
            model,
            assignment,
            rank,
            backend,
            store,
            kv,
            node_layers,
            local_index,
            prefetch_queue,
            prefetch_thread,
        }
    }

    /// This node's layers in traversal order
    pub fn node_layers(&self) -> &[u32] {
        &self.node_layers
    }

    /// KV shard index of a global layer
    pub fn local_layer(&self, layer: u32) -> Option<usize> {
        self.local_index.get(&layer).copied()
    }

    /// Count one pending reference on every layer of the window this
    /// node computes for `cycle`. Called when a frame enters the node.
    pub fn acquire_cycle_refs(&self, cycle: u32) {
        let Some(window) = self.assignment.window(self.rank, cycle) else {
            return;
        };
        let mut refs = self.tile_refs.lock();
        for layer in window.begin..window.end {
            if let Some(&i) = self.local_index.get(&layer) {
                refs[i] += 1;
            }
        }
    }

    /// Drop the references of a frame that will never be computed
    /// (cancellation purge of a queued frame)
    pub fn drop_cycle_refs(&self, cycle: u32) {
        let Some(window) = self.assignment.window(self.rank, cycle) else {
            return;
        };
        let mut refs = self.tile_refs.lock();
        for layer in window.begin..window.end {
            if let Some(&i) = self.local_index.get(&layer) {
                refs[i] = refs[i].saturating_sub(1);
            }
        }
    }

    /// Issue prefetches for the traversal-order horizon starting at a
    /// layer's slot
    fn prefetch_ahead(&self, from_slot: usize) {
        let Some(queue) = &self.prefetch_queue else {
            return;
        };
        let n = self.node_layers.len();
        let mut requested = self.requested.lock();
        for step in 0..self.config.prefetch_horizon.min(n) {
            let slot = (from_slot + step) % n;
            if !requested[slot] && !self.store.is_hot(self.node_layers[slot] as usize) {
                requested[slot] = true;
                queue.push(self.node_layers[slot] as usize);
            }
        }
    }

    /// Release the tile `hysteresis` slots behind `slot` if nothing
    /// in flight still references it
    fn release_behind(&self, slot: usize) {
        if !self.config.prefetch {
            return;
        }
        let n = self.node_layers.len();
        let k = self.config.release_hysteresis;
        if n <= k {
            return;
        }
        let candidate = (slot + n - k) % n;

        let refs = self.tile_refs.lock();
        if refs[candidate] == 0 {
            let layer = self.node_layers[candidate];
            if let Err(e) = self.store.release(layer as usize) {
                tracing::warn!(layer, error = %e, "release failed");
            }
            self.requested.lock()[candidate] = false;
        }
    }

    /// Compute this node's window for one cycle over a micro-batch, in
    /// place. The only blocking point is awaiting tile residency.
    pub fn process_slice(
        &self,
        cycle: u32,
        activations: &mut [f16],
        entries: &[BatchEntry],
    ) -> Result<()> {
        let Some(window) = self.assignment.window(self.rank, cycle) else {
            return Err(EngineError::NoWindow {
                rank: self.rank,
                cycle,
            });
        };

        for layer in window.begin..window.end {
            let slot = self.local_index[&(layer)];

            self.prefetch_ahead(slot);

            if self.config.prefetch {
                self.store.wait_hot(layer as usize)?;
            } else if !self.store.is_hot(layer as usize) {
                // lazy path: fault the tile in on the compute thread
                self.store.prefetch(layer as usize)?;
            }

            let tile = self.store.address(layer as usize)?;
            {
                let mut kv = self.kv.lock();
                self.backend
                    .step_layer(tile, activations, entries, &mut kv, slot)?;
            }

            {
                let mut refs = self.tile_refs.lock();
                refs[slot] = refs[slot].saturating_sub(1);
            }
            self.release_behind(slot);
        }

        Ok(())
    }

    /// Shut the prefetch thread down
    pub fn shutdown(&mut self) {
        if let Some(queue) = &self.prefetch_queue {
            queue.close();
        }
        if let Some(handle) = self.prefetch_thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for NodeCore {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Drop one sequence's entries from a queued frame (cancellation purge),
/// keeping the frame itself for in-flight bookkeeping
pub(crate) fn strip_seq(
    frame: &mut ringlm_protocol::DataFrame,
    seq: u32,
    hidden_dim: usize,
) {
    use ringlm_protocol::{ActivationPayload, DataFrame, TokenMeta};

    let Ok(payload) = frame.decode_payload(hidden_dim) else {
        return;
    };
    if !payload.metas.iter().any(|m| m.seq_id == seq) {
        return;
    }

    let mut kept_acts = Vec::new();
    let mut kept_metas: Vec<TokenMeta> = Vec::new();
    for (i, meta) in payload.metas.iter().enumerate() {
        if meta.seq_id != seq {
            kept_acts
                .extend_from_slice(&payload.activations[i * hidden_dim..(i + 1) * hidden_dim]);
            kept_metas.push(*meta);
        }
    }

    *frame = DataFrame::new(
        frame.cycle_id,
        frame.batch_id,
        &ActivationPayload {
            activations: kept_acts,
            metas: kept_metas,
        },
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use ringlm_backend::Accel;
    use ringlm_model::ArtifactBuilder;
    use ringlm_planner::LayerWindow;
    use std::env;
    use std::fs;

    fn test_model() -> ModelConfig {
        ModelConfig {
            n_layers: 4,
            hidden_dim: 8,
            vocab_size: 260,
            n_ctx_train: 512,
            weight_seed: 3,
        }
    }

    fn two_cycle_assignment() -> Assignment {
        Assignment {
            n_layers: 4,
            cycles: 2,
            layer_counts: vec![4],
            gpu_layers: vec![0],
            windows: vec![
                LayerWindow { node: 0, cycle: 0, begin: 0, end: 2 },
                LayerWindow { node: 0, cycle: 1, begin: 2, end: 4 },
            ],
        }
    }

    fn make_core(name: &str, prefetch: bool) -> (NodeCore, std::path::PathBuf) {
        let path = env::temp_dir().join(name);
        let model = test_model();
        ArtifactBuilder::new(model.clone()).write(&path).unwrap();
        let store = Arc::new(WeightStore::open(&path).unwrap());
        let backend = Backend::new(Accel::Cpu, model).unwrap();
        let core = NodeCore::new(
            EngineConfig {
                prefetch,
                ..EngineConfig::default()
            },
            two_cycle_assignment(),
            0,
            backend,
            store,
            64,
        );
        (core, path)
    }

    #[test]
    fn test_traversal_order() {
        let (core, path) = make_core("ringlm-core-order.rlmw", false);
        assert_eq!(core.node_layers(), &[0, 1, 2, 3]);
        assert_eq!(core.local_layer(2), Some(2));
        assert_eq!(core.local_layer(9), None);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_process_slice_runs_both_cycles() {
        let (core, path) = make_core("ringlm-core-slices.rlmw", false);

        let entries = vec![BatchEntry::new(65, 0, 1)];
        let mut acts: Vec<f16> = core.backend.embed(&ringlm_backend::Batch {
            entries: entries.clone(),
        });

        core.acquire_cycle_refs(0);
        core.process_slice(0, &mut acts, &entries).unwrap();
        core.acquire_cycle_refs(1);
        core.process_slice(1, &mut acts, &entries).unwrap();

        // every local layer wrote its KV row
        let kv = core.kv.lock();
        for slot in 0..4 {
            assert!(kv.read(slot, 1, 0).is_some());
        }
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_prefetch_thread_hydrates_tiles() {
        let (core, path) = make_core("ringlm-core-prefetch.rlmw", true);

        let entries = vec![BatchEntry::new(66, 0, 1)];
        let mut acts: Vec<f16> = core.backend.embed(&ringlm_backend::Batch {
            entries: entries.clone(),
        });

        core.acquire_cycle_refs(0);
        core.process_slice(0, &mut acts, &entries).unwrap();
        core.acquire_cycle_refs(1);
        core.process_slice(1, &mut acts, &entries).unwrap();

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_missing_window_is_an_error() {
        let (core, path) = make_core("ringlm-core-nowindow.rlmw", false);
        let entries = vec![BatchEntry::new(1, 0, 1)];
        let mut acts = vec![f16::from_f32(0.0); 8];

        let err = core.process_slice(7, &mut acts, &entries).unwrap_err();
        assert!(matches!(err, EngineError::NoWindow { cycle: 7, .. }));
        let _ = fs::remove_file(&path);
    }
}
