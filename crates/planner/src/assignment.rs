//! Planner output: per-(node, cycle) layer windows

use serde::{Deserialize, Serialize};

/// One contiguous slice of layers computed by `node` during `cycle`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerWindow {
    pub node: usize,
    pub cycle: u32,
    /// First layer, inclusive
    pub begin: u32,
    /// Last layer, exclusive
    pub end: u32,
}

impl LayerWindow {
    pub fn len(&self) -> u32 {
        self.end - self.begin
    }

    pub fn is_empty(&self) -> bool {
        self.begin == self.end
    }

    pub fn contains(&self, layer: u32) -> bool {
        layer >= self.begin && layer < self.end
    }
}

/// The one-shot planner output for the whole cluster.
///
/// `windows` is in ring-traversal order: cycle-major, node-minor. The
/// concatenation of all windows covers `[0, n_layers)` exactly; within one
/// `(node, cycle)` pair the slice is contiguous. For `cycles == 1` each
/// node's single window is the spec's contiguous per-node form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
    /// Total model layers
    pub n_layers: u32,
    /// Global cycle count `C`
    pub cycles: u32,
    /// Per-node total layer count `x_i`
    pub layer_counts: Vec<u32>,
    /// Per-node GPU-offloaded prefix length `g_i`
    pub gpu_layers: Vec<u32>,
    /// Traversal-ordered windows
    pub windows: Vec<LayerWindow>,
}

impl Assignment {
    /// Build an assignment from operator-pinned per-node counts (the
    /// `n_layer_window` override), splitting each share into `cycles`
    /// contiguous near-equal slices in traversal order.
    pub fn from_counts(layer_counts: Vec<u32>, gpu_layers: Vec<u32>, cycles: u32) -> Self {
        let cycles = cycles.max(1);
        let n_layers = layer_counts.iter().sum();

        let mut windows = Vec::new();
        let mut next = 0u32;
        for cycle in 0..cycles {
            for (node, &x) in layer_counts.iter().enumerate() {
                let base = x / cycles;
                let extra = x % cycles;
                let len = base + if cycle < extra { 1 } else { 0 };
                windows.push(LayerWindow {
                    node,
                    cycle,
                    begin: next,
                    end: next + len,
                });
                next += len;
            }
        }

        Self {
            n_layers,
            cycles,
            layer_counts,
            gpu_layers,
            windows,
        }
    }

    /// Number of participating nodes
    pub fn n_world(&self) -> usize {
        self.layer_counts.len()
    }

    /// The windows one node computes, cycle order
    pub fn windows_for(&self, node: usize) -> Vec<LayerWindow> {
        self.windows
            .iter()
            .filter(|w| w.node == node)
            .copied()
            .collect()
    }

    /// The window one node computes during one cycle
    pub fn window(&self, node: usize, cycle: u32) -> Option<LayerWindow> {
        self.windows
            .iter()
            .find(|w| w.node == node && w.cycle == cycle)
            .copied()
    }

    /// Check the coverage invariant: windows are in traversal order,
    /// pairwise disjoint, and their union is exactly `[0, n_layers)`.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.layer_counts.iter().sum::<u32>() != self.n_layers {
            return Err("layer counts do not sum to n_layers".into());
        }
        if self.layer_counts.iter().any(|&x| x == 0) {
            return Err("every node needs at least one layer".into());
        }
        for (i, (&x, &g)) in self.layer_counts.iter().zip(&self.gpu_layers).enumerate() {
            if g > x {
                return Err(format!("node {i}: gpu_layers {g} exceeds window {x}"));
            }
        }

        let mut next = 0u32;
        for w in &self.windows {
            if w.begin != next {
                return Err(format!(
                    "window gap: expected begin {next}, found {}",
                    w.begin
                ));
            }
            if w.end < w.begin {
                return Err(format!("window inverted at layer {}", w.begin));
            }
            next = w.end;
        }
        if next != self.n_layers {
            return Err(format!(
                "windows cover [0, {next}), model has {} layers",
                self.n_layers
            ));
        }

        for node in 0..self.n_world() {
            let total: u32 = self.windows_for(node).iter().map(|w| w.len()).sum();
            if total != self.layer_counts[node] {
                return Err(format!(
                    "node {node}: windows sum to {total}, layer count says {}",
                    self.layer_counts[node]
                ));
            }
        }

        Ok(())
    }
}
