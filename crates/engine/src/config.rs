//! Engine tuning knobs

/// Pipeline engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Overlap disk reads with compute on a dedicated prefetch thread.
    /// When off, tiles fault in lazily and nothing is ever released.
    pub prefetch: bool,
    /// Layers the prefetch cursor runs ahead of the compute cursor
    pub prefetch_horizon: usize,
    /// Layers kept hot behind the compute cursor before release
    pub release_hysteresis: usize,
    /// Physical micro-batch bound
    pub n_ubatch: usize,
    /// Ingress/egress buffer capacity in frames; must exceed the cycle
    /// count for deadlock freedom
    pub queue_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            prefetch: false,
            prefetch_horizon: 2,
            release_hysteresis: 2,
            n_ubatch: 512,
            queue_capacity: 16,
        }
    }
}
