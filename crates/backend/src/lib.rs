//! Compute backend for one node's layer window.
//!
//! The tensor kernels proper are external to the core; this crate is the
//! seam. Accelerator variants form a closed tagged enum selected once at
//! process start (no trait objects). The CPU variant is a deterministic
//! reference implementation: embedding, per-layer mix plus an
//! attention-style read over the sequence's cached cells, and a seeded
//! output projection. Identical inputs produce identical outputs on every
//! node, which is what the coherence and determinism tests key on.
//!
//! All activations are `f16` end-to-end (per-layer math widens to `f32`
//! and rounds back), so a value crossing the wire is bit-identical to one
//! staying on-node.

mod batch;
mod error;
mod reference;
mod variant;

#[cfg(feature = "cuda")]
mod cuda;

#[cfg(all(feature = "metal", target_os = "macos"))]
mod metal;

pub use batch::{Batch, BatchEntry, ComputeOutcome, LogitsRow};
pub use error::{BackendError, Result};
pub use variant::{Accel, Backend};

#[cfg(feature = "cuda")]
pub use cuda::CudaBackend;

#[cfg(all(feature = "metal", target_os = "macos"))]
pub use metal::MetalBackend;
