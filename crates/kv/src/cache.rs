//! Cell storage and mutation application

use half::f16;
use std::collections::HashMap;

use crate::error::{KvError, Result};
use crate::mutation::KvMutation;

/// One cached token: its position and the K/V rows for one layer
#[derive(Debug, Clone, PartialEq)]
pub struct Cell {
    /// Position within the sequence; remapped by `Add`/`Divide`
    pub pos: i32,
    /// Key row, `kv_dim` wide
    pub k: Vec<f16>,
    /// Value row, `kv_dim` wide
    pub v: Vec<f16>,
}

#[derive(Default)]
struct LayerCache {
    seqs: HashMap<u32, Vec<Cell>>,
}

/// KV cache for the layers a node owns.
///
/// Layers are indexed locally (0 = first owned layer). A sequence holds at
/// most `n_ctx_slot` cells per layer; `write` past that bound fails with
/// [`KvError::Full`], which the backend surfaces as the `kv_full` decode
/// outcome.
pub struct KvCache {
    layers: Vec<LayerCache>,
    n_ctx_slot: usize,
    kv_dim: usize,
}

impl KvCache {
    /// Create a cache for `n_layers` locally-owned layers
    pub fn new(n_layers: usize, n_ctx_slot: usize, kv_dim: usize) -> Self {
        let layers = (0..n_layers).map(|_| LayerCache::default()).collect();
        Self {
            layers,
            n_ctx_slot,
            kv_dim,
        }
    }

    /// Width of one K or V row
    pub fn kv_dim(&self) -> usize {
        self.kv_dim
    }

    /// Per-sequence cell bound
    pub fn n_ctx_slot(&self) -> usize {
        self.n_ctx_slot
    }

    /// Number of locally-owned layers
    pub fn n_layers(&self) -> usize {
        self.layers.len()
    }

    fn layer(&self, layer: usize) -> Result<&LayerCache> {
        self.layers.get(layer).ok_or(KvError::LayerOutOfRange {
            layer,
            n_layers: self.layers.len(),
        })
    }

    fn layer_mut(&mut self, layer: usize) -> Result<&mut LayerCache> {
        let n_layers = self.layers.len();
        self.layers
            .get_mut(layer)
            .ok_or(KvError::LayerOutOfRange { layer, n_layers })
    }

    /// Write a K/V row. Overwrites an existing cell at the same position
    /// (idempotent); inserts sorted otherwise.
    pub fn write(
        &mut self,
        layer: usize,
        seq: u32,
        pos: i32,
        k: Vec<f16>,
        v: Vec<f16>,
    ) -> Result<()> {
        let n_ctx_slot = self.n_ctx_slot;
        let cells = self.layer_mut(layer)?.seqs.entry(seq).or_default();

        match cells.binary_search_by_key(&pos, |c| c.pos) {
            Ok(i) => {
                cells[i].k = k;
                cells[i].v = v;
            }
            Err(i) => {
                if cells.len() >= n_ctx_slot {
                    return Err(KvError::Full { seq });
                }
                cells.insert(i, Cell { pos, k, v });
            }
        }
        Ok(())
    }

    /// Read the K/V rows at an exact position
    pub fn read(&self, layer: usize, seq: u32, pos: i32) -> Option<(&[f16], &[f16])> {
        let cells = self.layer(layer).ok()?.seqs.get(&seq)?;
        let i = cells.binary_search_by_key(&pos, |c| c.pos).ok()?;
        Some((&cells[i].k, &cells[i].v))
    }

    /// All cells of a sequence at one layer, sorted by position
    pub fn cells(&self, layer: usize, seq: u32) -> &[Cell] {
        self.layer(layer)
            .ok()
            .and_then(|l| l.seqs.get(&seq))
            .map(|c| c.as_slice())
            .unwrap_or(&[])
    }

    /// Cell count for a sequence at layer 0 (identical across layers when
    /// every write went through `decode`)
    pub fn seq_len(&self, seq: u32) -> usize {
        self.cells(0, seq).len()
    }

    /// Highest position held for a sequence, or -1 when empty
    pub fn seq_pos_max(&self, seq: u32) -> i32 {
        self.cells(0, seq).last().map(|c| c.pos).unwrap_or(-1)
    }

    /// Apply one structural mutation to every local layer
    pub fn apply(&mut self, mutation: KvMutation) -> Result<()> {
        match mutation {
            KvMutation::Clear => {
                for layer in &mut self.layers {
                    layer.seqs.clear();
                }
            }
            KvMutation::Remove { seq, p0, p1 } => {
                let (lo, hi) = KvMutation::bounds(p0, p1);
                for layer in &mut self.layers {
                    if let Some(cells) = layer.seqs.get_mut(&seq) {
                        cells.retain(|c| c.pos < lo || c.pos >= hi);
                    }
                }
            }
            KvMutation::Copy { src, dst, p0, p1 } => {
                let (lo, hi) = KvMutation::bounds(p0, p1);
                for layer in &mut self.layers {
                    let copied: Vec<Cell> = layer
                        .seqs
                        .get(&src)
                        .map(|cells| {
                            cells
                                .iter()
                                .filter(|c| c.pos >= lo && c.pos < hi)
                                .cloned()
                                .collect()
                        })
                        .unwrap_or_default();
                    if copied.len() > self.n_ctx_slot {
                        return Err(KvError::Full { seq: dst });
                    }
                    let dst_cells = layer.seqs.entry(dst).or_default();
                    for cell in copied {
                        match dst_cells.binary_search_by_key(&cell.pos, |c| c.pos) {
                            Ok(i) => dst_cells[i] = cell,
                            Err(i) => {
                                if dst_cells.len() >= self.n_ctx_slot {
                                    return Err(KvError::Full { seq: dst });
                                }
                                dst_cells.insert(i, cell);
                            }
                        }
                    }
                }
            }
            KvMutation::Add { seq, p0, p1, delta } => {
                let (lo, hi) = KvMutation::bounds(p0, p1);
                for layer in &mut self.layers {
                    if let Some(cells) = layer.seqs.get_mut(&seq) {
                        for cell in cells.iter_mut() {
                            if cell.pos >= lo && cell.pos < hi {
                                cell.pos += delta;
                            }
                        }
                        // shifted below zero means discarded
                        cells.retain(|c| c.pos >= 0);
                        cells.sort_by_key(|c| c.pos);
                    }
                }
            }
            KvMutation::Divide {
                seq,
                p0,
                p1,
                divisor,
            } => {
                if divisor <= 0 {
                    return Err(KvError::InvalidMutation(format!(
                        "divide by {divisor}"
                    )));
                }
                let (lo, hi) = KvMutation::bounds(p0, p1);
                for layer in &mut self.layers {
                    if let Some(cells) = layer.seqs.get_mut(&seq) {
                        for cell in cells.iter_mut() {
                            if cell.pos >= lo && cell.pos < hi {
                                cell.pos /= divisor;
                            }
                        }
                        // group attention maps several tokens onto one
                        // position; duplicates are kept, order stable
                        cells.sort_by_key(|c| c.pos);
                    }
                }
            }
        }
        Ok(())
    }

    /// Live sequence ids, ascending
    pub fn sequences(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self
            .layers
            .first()
            .map(|l| l.seqs.keys().copied().collect())
            .unwrap_or_default();
        ids.sort_unstable();
        ids
    }

    /// Total bytes held in cells
    pub fn memory_bytes(&self) -> usize {
        self.layers
            .iter()
            .flat_map(|l| l.seqs.values())
            .flat_map(|cells| cells.iter())
            .map(|c| (c.k.len() + c.v.len()) * 2 + std::mem::size_of::<i32>())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(x: f32, dim: usize) -> Vec<f16> {
        vec![f16::from_f32(x); dim]
    }

    fn filled(n_layers: usize, seq: u32, n: i32) -> KvCache {
        let mut cache = KvCache::new(n_layers, 512, 4);
        for layer in 0..n_layers {
            for pos in 0..n {
                cache
                    .write(layer, seq, pos, row(pos as f32, 4), row(-(pos as f32), 4))
                    .unwrap();
            }
        }
        cache
    }

    #[test]
    fn test_write_read() {
        let mut cache = KvCache::new(2, 8, 4);
        cache.write(0, 1, 0, row(1.0, 4), row(2.0, 4)).unwrap();

        let (k, v) = cache.read(0, 1, 0).unwrap();
        assert_eq!(k[0], f16::from_f32(1.0));
        assert_eq!(v[0], f16::from_f32(2.0));
        assert!(cache.read(1, 1, 0).is_none());
    }

    #[test]
    fn test_write_is_idempotent() {
        let mut cache = KvCache::new(1, 8, 4);
        cache.write(0, 1, 3, row(1.0, 4), row(1.0, 4)).unwrap();
        cache.write(0, 1, 3, row(9.0, 4), row(9.0, 4)).unwrap();

        assert_eq!(cache.seq_len(1), 1);
        let (k, _) = cache.read(0, 1, 3).unwrap();
        assert_eq!(k[0], f16::from_f32(9.0));
    }

    #[test]
    fn test_full() {
        let mut cache = KvCache::new(1, 2, 4);
        cache.write(0, 1, 0, row(0.0, 4), row(0.0, 4)).unwrap();
        cache.write(0, 1, 1, row(1.0, 4), row(1.0, 4)).unwrap();

        let err = cache.write(0, 1, 2, row(2.0, 4), row(2.0, 4)).unwrap_err();
        assert!(matches!(err, KvError::Full { seq: 1 }));
    }

    #[test]
    fn test_remove_range() {
        let mut cache = filled(2, 1, 10);
        cache
            .apply(KvMutation::Remove { seq: 1, p0: 2, p1: 5 })
            .unwrap();

        assert_eq!(cache.seq_len(1), 7);
        assert!(cache.read(0, 1, 2).is_none());
        assert!(cache.read(0, 1, 5).is_some());
        assert!(cache.read(1, 1, 3).is_none());
    }

    #[test]
    fn test_remove_is_idempotent() {
        let mut cache = filled(1, 1, 10);
        let m = KvMutation::Remove { seq: 1, p0: 2, p1: 5 };
        cache.apply(m).unwrap();
        let after_first: Vec<i32> = cache.cells(0, 1).iter().map(|c| c.pos).collect();
        cache.apply(m).unwrap();
        let after_second: Vec<i32> = cache.cells(0, 1).iter().map(|c| c.pos).collect();
        assert_eq!(after_first, after_second);
    }

    #[test]
    fn test_context_shift_sequence() {
        // the S4 shape: keep 16, discard [16, 152), shift the rest left
        let mut cache = filled(1, 0, 256);
        cache
            .apply(KvMutation::Remove { seq: 0, p0: 16, p1: 152 })
            .unwrap();
        cache
            .apply(KvMutation::Add {
                seq: 0,
                p0: 152,
                p1: 256,
                delta: -136,
            })
            .unwrap();

        assert_eq!(cache.seq_len(0), 120);
        assert_eq!(cache.seq_pos_max(0), 119);
        // positions are contiguous [0, 16) ∪ shifted [16, 120)
        let positions: Vec<i32> = cache.cells(0, 0).iter().map(|c| c.pos).collect();
        assert_eq!(positions, (0..120).collect::<Vec<_>>());
    }

    #[test]
    fn test_add_drops_negative() {
        let mut cache = filled(1, 1, 4);
        cache
            .apply(KvMutation::Add {
                seq: 1,
                p0: 0,
                p1: 2,
                delta: -10,
            })
            .unwrap();
        assert_eq!(cache.seq_len(1), 2);
    }

    #[test]
    fn test_divide() {
        let mut cache = filled(1, 1, 8);
        cache
            .apply(KvMutation::Divide {
                seq: 1,
                p0: 0,
                p1: 8,
                divisor: 2,
            })
            .unwrap();

        let positions: Vec<i32> = cache.cells(0, 1).iter().map(|c| c.pos).collect();
        assert_eq!(positions, vec![0, 0, 1, 1, 2, 2, 3, 3]);
    }

    #[test]
    fn test_divide_by_zero_rejected() {
        let mut cache = filled(1, 1, 4);
        let err = cache
            .apply(KvMutation::Divide {
                seq: 1,
                p0: 0,
                p1: 4,
                divisor: 0,
            })
            .unwrap_err();
        assert!(matches!(err, KvError::InvalidMutation(_)));
    }

    #[test]
    fn test_copy() {
        let mut cache = filled(2, 0, 5);
        cache
            .apply(KvMutation::Copy {
                src: 0,
                dst: 3,
                p0: -1,
                p1: -1,
            })
            .unwrap();

        assert_eq!(cache.seq_len(3), 5);
        assert_eq!(cache.cells(1, 3), cache.cells(1, 0));
    }

    #[test]
    fn test_disjoint_mutations_commute() {
        let a = KvMutation::Remove { seq: 1, p0: 0, p1: 3 };
        let b = KvMutation::Add {
            seq: 1,
            p0: 5,
            p1: 10,
            delta: 7,
        };

        let mut ab = filled(1, 1, 10);
        ab.apply(a).unwrap();
        ab.apply(b).unwrap();

        let mut ba = filled(1, 1, 10);
        ba.apply(b).unwrap();
        ba.apply(a).unwrap();

        assert_eq!(ab.cells(0, 1), ba.cells(0, 1));
    }

    #[test]
    fn test_clear() {
        let mut cache = filled(2, 1, 5);
        cache.apply(KvMutation::Clear).unwrap();
        assert_eq!(cache.seq_len(1), 0);
        assert!(cache.sequences().is_empty());
    }

    #[test]
    fn test_identical_streams_identical_state() {
        // the coherence property: two ranks applying the same mutation
        // stream over identically-populated caches end byte-identical
        let stream = [
            KvMutation::Remove { seq: 1, p0: 2, p1: 4 },
            KvMutation::Copy { src: 1, dst: 2, p0: -1, p1: -1 },
            KvMutation::Add { seq: 2, p0: 4, p1: -1, delta: -2 },
            KvMutation::Divide { seq: 1, p0: 0, p1: 8, divisor: 2 },
        ];

        let mut rank_a = filled(2, 1, 8);
        let mut rank_b = filled(2, 1, 8);
        for m in stream {
            rank_a.apply(m).unwrap();
            rank_b.apply(m).unwrap();
        }

        for layer in 0..2 {
            for seq in rank_a.sequences() {
                assert_eq!(rank_a.cells(layer, seq), rank_b.cells(layer, seq));
            }
        }
    }
}
