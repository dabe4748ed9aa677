//! Memory-mapped weight store with managed prefetch and release
//!
//! Tiles are never copied into managed buffers. `prefetch` forces the OS to
//! populate the page cache for a tile (advice plus a one-word touch per
//! page); `release` advises the OS that the tile's pages may be reclaimed.
//! The pipeline engine sizes and times both so that pages fetched for one
//! cycle are not evicted before the next cycle consumes them.

use memmap2::{Advice, Mmap};
use parking_lot::{Condvar, Mutex};
use std::fs::File;
use std::path::Path;

use crate::artifact::{Artifact, TileEntry};
use crate::config::ModelConfig;
use crate::error::{ModelError, Result};

const PAGE_SIZE: usize = 4096;

/// Observable residency of one weight tile
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Residency {
    /// No valid mapping (store not open)
    Unmapped,
    /// Virtual address valid, pages not known to be faulted in
    MappedCold,
    /// Pages faulted in and referenced
    MappedHot,
}

struct TileState {
    residency: Mutex<Residency>,
    hot: Condvar,
}

/// Memory-mapped per-layer weight store
pub struct WeightStore {
    mmap: Mmap,
    artifact: Artifact,
    tiles: Vec<TileState>,
}

impl WeightStore {
    /// Map the artifact at `path`; every tile starts `MappedCold`
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        let mmap = unsafe { Mmap::map(&file)? };

        let artifact = Artifact::parse(&mmap)?;
        for (layer, tile) in artifact.tiles.iter().enumerate() {
            let end = tile.offset.checked_add(tile.len);
            if end.is_none() || end.unwrap() as usize > mmap.len() {
                return Err(ModelError::TileOutOfBounds { layer });
            }
        }

        let tiles = (0..artifact.config.n_layers)
            .map(|_| TileState {
                residency: Mutex::new(Residency::MappedCold),
                hot: Condvar::new(),
            })
            .collect();

        tracing::info!(
            n_layers = artifact.config.n_layers,
            hidden_dim = artifact.config.hidden_dim,
            bytes = mmap.len(),
            "weight store mapped"
        );

        Ok(Self {
            mmap,
            artifact,
            tiles,
        })
    }

    /// Model shape from the manifest
    pub fn config(&self) -> &ModelConfig {
        &self.artifact.config
    }

    fn entry(&self, layer: usize) -> Result<TileEntry> {
        self.artifact.tile(layer)
    }

    /// Address of a layer's tile inside the mapping
    pub fn address(&self, layer: usize) -> Result<&[u8]> {
        let tile = self.entry(layer)?;
        Ok(&self.mmap[tile.offset as usize..(tile.offset + tile.len) as usize])
    }

    /// Force the OS to populate the tile's pages, then mark it hot.
    ///
    /// Blocking: touches one word per page. Runs on the prefetch thread,
    /// never on the compute loop.
    pub fn prefetch(&self, layer: usize) -> Result<()> {
        let tile = self.entry(layer)?;

        #[cfg(unix)]
        let _ = self
            .mmap
            .advise_range(Advice::WillNeed, tile.offset as usize, tile.len as usize);

        let bytes = self.address(layer)?;
        let mut offset = 0;
        while offset < bytes.len() {
            // volatile so the read is not optimised away
            unsafe { std::ptr::read_volatile(bytes.as_ptr().add(offset)) };
            offset += PAGE_SIZE;
        }

        let state = &self.tiles[layer];
        *state.residency.lock() = Residency::MappedHot;
        state.hot.notify_all();
        Ok(())
    }

    /// Advise the OS that the tile's pages may be reclaimed.
    ///
    /// The mapping stays valid; pages refault from the artifact on next
    /// access. Callers must not release a tile that an in-flight cycle still
    /// references; the engine tracks per-tile reference counts for that.
    pub fn release(&self, layer: usize) -> Result<()> {
        let tile = self.entry(layer)?;

        #[cfg(unix)]
        {
            use memmap2::UncheckedAdvice;
            // Read-only file-backed mapping: DontNeed cannot lose data
            let _ = unsafe {
                self.mmap.unchecked_advise_range(
                    UncheckedAdvice::DontNeed,
                    tile.offset as usize,
                    tile.len as usize,
                )
            };
        }

        *self.tiles[layer].residency.lock() = Residency::MappedCold;
        Ok(())
    }

    /// Current residency of a tile
    pub fn residency(&self, layer: usize) -> Residency {
        match self.tiles.get(layer) {
            Some(state) => *state.residency.lock(),
            None => Residency::Unmapped,
        }
    }

    /// Block until the tile is `MappedHot`.
    ///
    /// The pipeline engine's only permitted blocking point inside a step.
    pub fn wait_hot(&self, layer: usize) -> Result<()> {
        let state = self
            .tiles
            .get(layer)
            .ok_or(ModelError::LayerOutOfRange {
                layer,
                n_layers: self.tiles.len(),
            })?;

        let mut residency = state.residency.lock();
        while *residency != Residency::MappedHot {
            state.hot.wait(&mut residency);
        }
        Ok(())
    }

    /// Whether the tile is already hot, without blocking
    pub fn is_hot(&self, layer: usize) -> bool {
        self.residency(layer) == Residency::MappedHot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::{tile_values, ArtifactBuilder};
    use std::env;
    use std::fs;

    fn write_test_artifact(name: &str) -> std::path::PathBuf {
        let path = env::temp_dir().join(name);
        let config = ModelConfig {
            n_layers: 3,
            hidden_dim: 16,
            vocab_size: 260,
            n_ctx_train: 512,
            weight_seed: 11,
        };
        ArtifactBuilder::new(config).write(&path).unwrap();
        path
    }

    #[test]
    fn test_open_and_address() {
        let path = write_test_artifact("ringlm-store-open.rlmw");
        let store = WeightStore::open(&path).unwrap();

        assert_eq!(store.config().n_layers, 3);
        let tile = store.address(1).unwrap();
        assert_eq!(tile.len(), store.config().tile_bytes());

        let expected = tile_values(store.config(), 1);
        let got: Vec<f32> = tile
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        assert_eq!(got, expected);

        assert!(store.address(3).is_err());

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_prefetch_release_residency() {
        let path = write_test_artifact("ringlm-store-residency.rlmw");
        let store = WeightStore::open(&path).unwrap();

        assert_eq!(store.residency(0), Residency::MappedCold);

        store.prefetch(0).unwrap();
        assert_eq!(store.residency(0), Residency::MappedHot);
        store.wait_hot(0).unwrap();

        store.release(0).unwrap();
        assert_eq!(store.residency(0), Residency::MappedCold);

        assert_eq!(store.residency(99), Residency::Unmapped);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_wait_hot_wakes_on_prefetch() {
        let path = write_test_artifact("ringlm-store-wait.rlmw");
        let store = std::sync::Arc::new(WeightStore::open(&path).unwrap());

        let waiter = {
            let store = store.clone();
            std::thread::spawn(move || store.wait_hot(2))
        };

        std::thread::sleep(std::time::Duration::from_millis(20));
        store.prefetch(2).unwrap();
        waiter.join().unwrap().unwrap();

        let _ = fs::remove_file(&path);
    }
}
