//! Deterministic reference math shared by every accelerator variant
//!
//! A stand-in for the real kernels with the same data flow: the embedding
//! is seeded from the artifact, each layer applies its tile's scale/shift
//! and an attention-style weighted read over the sequence's cached cells,
//! and the output projection is a dot against seeded vocabulary rows.

use half::f16;
use ringlm_kv::KvCache;
use ringlm_model::{splitmix64, unit_f32, ModelConfig, Token};

use crate::batch::BatchEntry;
use crate::error::{BackendError, Result};

/// Embed one token into a hidden-dim activation row
pub fn embed_token(config: &ModelConfig, token: Token) -> Vec<f16> {
    let d = config.hidden_dim;
    (0..d)
        .map(|j| {
            let bits = splitmix64(
                config
                    .weight_seed
                    .wrapping_mul(0x9E37_79B9)
                    ^ ((token as u64) << 20)
                    ^ j as u64,
            );
            f16::from_f32(unit_f32(bits) * 2.0 - 1.0)
        })
        .collect()
}

/// Split a tile into its scale and shift vectors
fn tile_vectors(config: &ModelConfig, tile: &[u8]) -> Result<(Vec<f32>, Vec<f32>)> {
    let d = config.hidden_dim;
    if tile.len() < d * 8 {
        return Err(BackendError::BadActivationWidth {
            expected: d * 8,
            got: tile.len(),
        });
    }
    let read = |idx: usize| {
        let b = &tile[idx * 4..idx * 4 + 4];
        f32::from_le_bytes([b[0], b[1], b[2], b[3]])
    };
    let scale = (0..d).map(read).collect();
    let shift = (d..2 * d).map(read).collect();
    Ok((scale, shift))
}

/// Run one layer over a micro-batch in place.
///
/// `local_layer` indexes the node's KV shard; `tile` is the layer's weight
/// tile. Entries are processed in batch order so a later entry of the same
/// sequence attends to the cells written by an earlier one.
pub fn layer_forward(
    config: &ModelConfig,
    tile: &[u8],
    activations: &mut [f16],
    entries: &[BatchEntry],
    kv: &mut KvCache,
    local_layer: usize,
) -> Result<()> {
    let d = config.hidden_dim;
    if activations.len() != entries.len() * d {
        return Err(BackendError::BadActivationWidth {
            expected: entries.len() * d,
            got: activations.len(),
        });
    }

    let (scale, shift) = tile_vectors(config, tile)?;

    for (i, entry) in entries.iter().enumerate() {
        let row = &mut activations[i * d..(i + 1) * d];

        // tile-parameterised mix, widened to f32
        let mut mix = vec![0.0f32; d];
        for j in 0..d {
            mix[j] = row[j].to_f32() * scale[j] + shift[j];
        }

        let k: Vec<f16> = mix.iter().map(|&x| f16::from_f32(x)).collect();
        let v: Vec<f16> = mix.iter().map(|&x| f16::from_f32(x * 0.5)).collect();
        kv.write(local_layer, entry.seq, entry.pos, k, v)
            .map_err(|e| match e {
                ringlm_kv::KvError::Full { .. } => BackendError::KvFull { offset: i },
                other => BackendError::Kv(other),
            })?;

        // attention-style read: causally weighted average over cached cells
        let mut acc = vec![0.0f32; d];
        let mut norm = 0.0f32;
        for cell in kv.cells(local_layer, entry.seq) {
            if cell.pos > entry.pos {
                continue;
            }
            let w = 1.0 / (1.0 + (entry.pos - cell.pos) as f32);
            for j in 0..d {
                acc[j] += w * cell.v[j].to_f32();
            }
            norm += w;
        }

        for j in 0..d {
            let out = mix[j] + if norm > 0.0 { acc[j] / norm } else { 0.0 };
            row[j] = f16::from_f32(out);
        }
    }

    Ok(())
}

/// Project one activation row onto the vocabulary
pub fn project_logits(config: &ModelConfig, row: &[f16]) -> Vec<f32> {
    let d = config.hidden_dim;
    (0..config.vocab_size)
        .map(|v| {
            let e = embed_token(config, v as Token);
            let mut dot = 0.0f32;
            for j in 0..d {
                dot += row[j].to_f32() * e[j].to_f32();
            }
            dot
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ringlm_model::tile_values;

    fn test_config() -> ModelConfig {
        ModelConfig {
            n_layers: 2,
            hidden_dim: 8,
            vocab_size: 260,
            n_ctx_train: 512,
            weight_seed: 5,
        }
    }

    fn tile_bytes(config: &ModelConfig, layer: usize) -> Vec<u8> {
        tile_values(config, layer)
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect()
    }

    #[test]
    fn test_embed_deterministic() {
        let config = test_config();
        assert_eq!(embed_token(&config, 42), embed_token(&config, 42));
        assert_ne!(embed_token(&config, 42), embed_token(&config, 43));
    }

    #[test]
    fn test_layer_forward_writes_kv_and_is_deterministic() {
        let config = test_config();
        let tile = tile_bytes(&config, 0);
        let entries = vec![
            BatchEntry::new(10, 0, 1),
            BatchEntry::new(11, 1, 1),
        ];

        let run = || {
            let mut kv = KvCache::new(1, 32, config.hidden_dim);
            let mut acts: Vec<f16> = entries
                .iter()
                .flat_map(|e| embed_token(&config, e.token))
                .collect();
            layer_forward(&config, &tile, &mut acts, &entries, &mut kv, 0).unwrap();
            (acts, kv.seq_len(1))
        };

        let (a, len_a) = run();
        let (b, len_b) = run();
        assert_eq!(a, b);
        assert_eq!(len_a, 2);
        assert_eq!(len_b, 2);
    }

    #[test]
    fn test_output_depends_on_cached_history() {
        let config = test_config();
        let tile = tile_bytes(&config, 0);

        // same token at pos 1, but different history at pos 0
        let decode_second = |first_token: Token| {
            let mut kv = KvCache::new(1, 32, config.hidden_dim);
            for (pos, tok) in [(0, first_token), (1, 99)] {
                let entries = vec![BatchEntry::new(tok, pos, 1)];
                let mut acts = embed_token(&config, tok);
                layer_forward(&config, &tile, &mut acts, &entries, &mut kv, 0).unwrap();
                if pos == 1 {
                    return acts;
                }
            }
            unreachable!()
        };

        assert_ne!(decode_second(1), decode_second(2));
    }

    #[test]
    fn test_kv_full_reports_offset() {
        let config = test_config();
        let tile = tile_bytes(&config, 0);
        let entries: Vec<BatchEntry> = (0..4)
            .map(|i| BatchEntry::new(i as Token, i, 1))
            .collect();

        let mut kv = KvCache::new(1, 2, config.hidden_dim);
        let mut acts: Vec<f16> = entries
            .iter()
            .flat_map(|e| embed_token(&config, e.token))
            .collect();

        let err = layer_forward(&config, &tile, &mut acts, &entries, &mut kv, 0).unwrap_err();
        assert!(matches!(err, BackendError::KvFull { offset: 2 }));
    }

    #[test]
    fn test_logits_shape() {
        let config = test_config();
        let row = embed_token(&config, 7);
        let logits = project_logits(&config, &row);
        assert_eq!(logits.len(), config.vocab_size);
    }
}
