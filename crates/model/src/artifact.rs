//! Artifact manifest: model shape plus per-layer tile table
//!
//! File layout (all little-endian):
//! - 4 bytes: magic `RLMW`
//! - 4 bytes: version (u32)
//! - 28 bytes: model config (n_layers, hidden_dim, vocab_size, n_ctx_train
//!   as u32; weight_seed as u64; trailing u32 reserved)
//! - n_layers * 16 bytes: tile table (offset u64, len u64), offsets relative
//!   to the start of the file
//! - tile data

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::fs::File;
use std::io::{BufWriter, Cursor, Read, Write};
use std::path::Path;

use crate::config::ModelConfig;
use crate::error::{ModelError, Result};

/// Artifact magic bytes
pub const ARTIFACT_MAGIC: &[u8; 4] = b"RLMW";

/// Artifact format version - increment when the layout changes
pub const ARTIFACT_VERSION: u32 = 1;

const CONFIG_SIZE: usize = 28;

/// One entry of the tile table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileEntry {
    /// Byte offset of the tile, relative to the start of the file
    pub offset: u64,
    /// Tile length in bytes
    pub len: u64,
}

/// Parsed artifact manifest
#[derive(Debug, Clone)]
pub struct Artifact {
    /// Model shape
    pub config: ModelConfig,
    /// Per-layer tile locations, indexed by layer
    pub tiles: Vec<TileEntry>,
}

impl Artifact {
    /// Manifest size in bytes for a model with `n_layers` layers
    pub fn manifest_size(n_layers: usize) -> usize {
        4 + 4 + CONFIG_SIZE + n_layers * 16
    }

    /// Parse a manifest from the head of a mapped or read file
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 4 + 4 + CONFIG_SIZE {
            return Err(ModelError::InvalidFormat("file shorter than manifest".into()));
        }

        let mut cursor = Cursor::new(data);

        let mut magic = [0u8; 4];
        cursor.read_exact(&mut magic)?;
        if &magic != ARTIFACT_MAGIC {
            return Err(ModelError::InvalidFormat("bad magic".into()));
        }

        let version = cursor.read_u32::<LittleEndian>()?;
        if version != ARTIFACT_VERSION {
            return Err(ModelError::InvalidFormat(format!(
                "version mismatch: found {}, expected {}",
                version, ARTIFACT_VERSION
            )));
        }

        let n_layers = cursor.read_u32::<LittleEndian>()? as usize;
        let hidden_dim = cursor.read_u32::<LittleEndian>()? as usize;
        let vocab_size = cursor.read_u32::<LittleEndian>()? as usize;
        let n_ctx_train = cursor.read_u32::<LittleEndian>()? as usize;
        let weight_seed = cursor.read_u64::<LittleEndian>()?;
        let _reserved = cursor.read_u32::<LittleEndian>()?;

        let config = ModelConfig {
            n_layers,
            hidden_dim,
            vocab_size,
            n_ctx_train,
            weight_seed,
        };
        config.validate()?;

        if data.len() < Self::manifest_size(n_layers) {
            return Err(ModelError::InvalidFormat("truncated tile table".into()));
        }

        let mut tiles = Vec::with_capacity(n_layers);
        for _ in 0..n_layers {
            let offset = cursor.read_u64::<LittleEndian>()?;
            let len = cursor.read_u64::<LittleEndian>()?;
            tiles.push(TileEntry { offset, len });
        }

        Ok(Self { config, tiles })
    }

    /// Tile entry for a layer
    pub fn tile(&self, layer: usize) -> Result<TileEntry> {
        self.tiles
            .get(layer)
            .copied()
            .ok_or(ModelError::LayerOutOfRange {
                layer,
                n_layers: self.tiles.len(),
            })
    }
}

/// Writes a synthetic artifact with deterministic tiles derived from the
/// config's `weight_seed`. Each tile is a scale vector followed by a shift
/// vector, `hidden_dim` f32 each.
pub struct ArtifactBuilder {
    config: ModelConfig,
}

impl ArtifactBuilder {
    pub fn new(config: ModelConfig) -> Self {
        Self { config }
    }

    /// Write the artifact to `path`
    pub fn write(&self, path: impl AsRef<Path>) -> Result<()> {
        self.config.validate()?;

        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);

        let n_layers = self.config.n_layers;
        let tile_bytes = self.config.tile_bytes() as u64;
        let data_start = Artifact::manifest_size(n_layers) as u64;

        writer.write_all(ARTIFACT_MAGIC)?;
        writer.write_u32::<LittleEndian>(ARTIFACT_VERSION)?;
        writer.write_u32::<LittleEndian>(self.config.n_layers as u32)?;
        writer.write_u32::<LittleEndian>(self.config.hidden_dim as u32)?;
        writer.write_u32::<LittleEndian>(self.config.vocab_size as u32)?;
        writer.write_u32::<LittleEndian>(self.config.n_ctx_train as u32)?;
        writer.write_u64::<LittleEndian>(self.config.weight_seed)?;
        writer.write_u32::<LittleEndian>(0)?; // reserved

        for layer in 0..n_layers {
            writer.write_u64::<LittleEndian>(data_start + layer as u64 * tile_bytes)?;
            writer.write_u64::<LittleEndian>(tile_bytes)?;
        }

        for layer in 0..n_layers {
            for value in tile_values(&self.config, layer) {
                writer.write_f32::<LittleEndian>(value)?;
            }
        }

        writer.flush()?;
        Ok(())
    }
}

/// The deterministic values of one tile: `hidden_dim` scales in [0.9, 1.1)
/// followed by `hidden_dim` shifts in [-0.05, 0.05)
pub fn tile_values(config: &ModelConfig, layer: usize) -> Vec<f32> {
    let d = config.hidden_dim;
    let mut values = Vec::with_capacity(2 * d);
    for j in 0..d {
        let r = unit_f32(splitmix64(
            config.weight_seed ^ ((layer as u64) << 32) ^ j as u64,
        ));
        values.push(0.9 + 0.2 * r);
    }
    for j in 0..d {
        let r = unit_f32(splitmix64(
            config.weight_seed ^ ((layer as u64) << 32) ^ (j as u64 | (1 << 62)),
        ));
        values.push(-0.05 + 0.1 * r);
    }
    values
}

/// SplitMix64 mixing step; stateless, used to derive tile and embedding
/// values from the artifact seed
pub fn splitmix64(x: u64) -> u64 {
    let mut z = x.wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// Map 64 random bits to [0, 1)
pub fn unit_f32(bits: u64) -> f32 {
    (bits >> 40) as f32 / (1u64 << 24) as f32
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::fs;

    fn test_config() -> ModelConfig {
        ModelConfig {
            n_layers: 4,
            hidden_dim: 8,
            vocab_size: 260,
            n_ctx_train: 2048,
            weight_seed: 7,
        }
    }

    #[test]
    fn test_artifact_roundtrip() {
        let path = env::temp_dir().join("ringlm-artifact-test.rlmw");
        let config = test_config();

        ArtifactBuilder::new(config.clone()).write(&path).unwrap();

        let data = fs::read(&path).unwrap();
        let artifact = Artifact::parse(&data).unwrap();

        assert_eq!(artifact.config, config);
        assert_eq!(artifact.tiles.len(), 4);
        for (layer, tile) in artifact.tiles.iter().enumerate() {
            assert_eq!(tile.len as usize, config.tile_bytes());
            let start = tile.offset as usize;
            let got: Vec<f32> = data[start..start + tile.len as usize]
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect();
            assert_eq!(got, tile_values(&config, layer));
        }

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_bad_magic_rejected() {
        let path = env::temp_dir().join("ringlm-artifact-badmagic.rlmw");
        ArtifactBuilder::new(test_config()).write(&path).unwrap();

        let mut data = fs::read(&path).unwrap();
        data[0] = b'X';
        assert!(matches!(
            Artifact::parse(&data),
            Err(ModelError::InvalidFormat(_))
        ));

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_tiles_differ_per_layer() {
        let config = test_config();
        assert_ne!(tile_values(&config, 0), tile_values(&config, 1));
    }
}
