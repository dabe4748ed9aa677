//! One-shot workload planner.
//!
//! Runs once at cluster bring-up on the head. Given each device's compute,
//! memory, disk and OS characteristics, it assigns every device a layer
//! share and a GPU-offload prefix, and picks the global cycle count, so
//! that the estimated critical path per token is minimised:
//!
//! ```text
//! T_token(x, g, C) = max_i [ T_compute_i(x_i, g_i) + T_io_i(x_i) ] / C
//!                  + T_ring_latency * C
//! ```
//!
//! subject to sum(x_i) = L, x_i >= 1, g_i <= x_i, RAM and VRAM fit, and a
//! per-OS-class effective disk cache (sequential-reader OSes keep more of
//! the mapped model resident than random-reader ones). The search space is
//! small (N <= 8 typical); integer coordinate descent is sufficient.

mod assignment;
mod error;
mod profile;
mod solver;

pub use assignment::{Assignment, LayerWindow};
pub use error::{PlannerError, Result};
pub use profile::{DeviceProfile, DiskCacheModel, OsClass};
pub use solver::{plan, prefetch_horizon, PlannerConfig};
