//! The piped-ring pipeline engine.
//!
//! One engine instance runs per node. Workers run a relay loop: pop an
//! ingress frame, compute their layer window for that frame's cycle, emit
//! the result downstream. The head drives whole forward passes: it splits
//! a micro-batch into up to `C` chunks, keeps them in flight around the
//! ring simultaneously, computes its own slice at the start of every
//! cycle, and converts the final activations to logits for the slot
//! scheduler.
//!
//! Disk prefetch overlaps compute: a dedicated thread faults tiles in
//! ahead of the compute cursor (horizon `h`), and tiles are released a
//! few layers behind it (hysteresis `k`) only once no in-flight cycle
//! still references them, which is what keeps prefetched pages from
//! being evicted before the cycle that needs them runs.

mod config;
mod core;
mod error;
mod head;
mod worker;

pub use self::core::NodeCore;
pub use config::EngineConfig;
pub use error::{EngineError, Result};
pub use head::HeadEngine;
pub use worker::WorkerEngine;
