//! Planner error types

use thiserror::Error;

/// Planner result type
pub type Result<T> = std::result::Result<T, PlannerError>;

/// Planner error types
#[derive(Debug, Error)]
pub enum PlannerError {
    /// No feasible assignment under the RAM constraints. Names the
    /// tightest-binding device so the operator knows what to upgrade.
    #[error(
        "No feasible assignment: device '{device}' is the tightest bound \
         (needs {need_bytes} bytes for its minimum share, has {have_bytes})"
    )]
    Infeasible {
        device: String,
        need_bytes: u64,
        have_bytes: u64,
    },

    #[error("Cluster is empty")]
    NoDevices,

    #[error("Model has no layers")]
    NoLayers,

    #[error("Invalid profile for '{device}': {reason}")]
    InvalidProfile { device: String, reason: String },
}
