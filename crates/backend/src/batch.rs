//! Batch types crossing the backend seam

use ringlm_model::Token;

/// One token of a micro-batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchEntry {
    /// Input token; only the head embeds, downstream ranks carry
    /// activations instead
    pub token: Token,
    /// KV position
    pub pos: i32,
    /// Owning sequence
    pub seq: u32,
    /// Whether logits should be extracted for this entry
    pub logits: bool,
}

impl BatchEntry {
    pub fn new(token: Token, pos: i32, seq: u32) -> Self {
        Self {
            token,
            pos,
            seq,
            logits: false,
        }
    }

    pub fn with_logits(mut self) -> Self {
        self.logits = true;
        self
    }
}

/// An ordered micro-batch, bounded by `n_ubatch` at the call site
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Batch {
    pub entries: Vec<BatchEntry>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entry: BatchEntry) {
        self.entries.push(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Logits for one flagged batch entry
#[derive(Debug, Clone, PartialEq)]
pub struct LogitsRow {
    /// Index of the entry within the micro-batch
    pub index: usize,
    /// One value per vocabulary entry
    pub values: Vec<f32>,
}

/// Result of a layer-window forward step
#[derive(Debug, Clone, PartialEq)]
pub enum ComputeOutcome {
    /// Non-final step: activations to forward along the ring,
    /// `n_tokens * hidden_dim` f16
    Activations(Vec<half::f16>),
    /// Final step at the head: one row per flagged entry
    Logits(Vec<LogitsRow>),
}
