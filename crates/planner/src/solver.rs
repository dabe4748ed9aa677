//! Coordinate-descent solver for the layer assignment

use crate::assignment::{Assignment, LayerWindow};
use crate::error::{PlannerError, Result};
use crate::profile::{DeviceProfile, DiskCacheModel};

/// Planner configuration. Everything here is an operator knob, including
/// the per-OS disk-cache coefficients.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct PlannerConfig {
    /// Bytes of one layer's weight tile
    pub layer_bytes: u64,
    /// Per-layer KV overhead a node pays for each owned layer, bytes
    pub kv_bytes_per_layer: u64,
    /// Smallest cycle count to consider; set equal to `cycle_max` to
    /// force a specific count
    pub cycle_min: u32,
    /// Largest cycle count to consider
    pub cycle_max: u32,
    /// Scales the head's effective compute: > 1 biases layers toward
    /// rank 0, < 1 away from it
    pub master_priority: f64,
    /// One ring traversal's transport latency, seconds
    pub ring_latency_s: f64,
    /// Per-OS effective disk cache coefficients
    pub disk_cache: DiskCacheModel,
    /// Bytes reserved on rank 0 for the speculative draft model; 0 when
    /// speculation is off
    pub draft_model_bytes: u64,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            layer_bytes: 1 << 30,
            kv_bytes_per_layer: 16 << 20,
            cycle_min: 1,
            cycle_max: 4,
            master_priority: 1.01,
            ring_latency_s: 2e-3,
            disk_cache: DiskCacheModel::default(),
            draft_model_bytes: 0,
        }
    }
}

struct DeviceModel<'a> {
    profile: &'a DeviceProfile,
    /// Effective compute after master_priority weighting
    flops_cpu: f64,
    flops_gpu: f64,
    /// Bytes of mapped tiles the OS keeps resident for this device
    effective_cache: u64,
    /// RAM available for tiles after fixed reservations
    ram_budget: u64,
}

impl DeviceModel<'_> {
    /// Largest x_i this device can hold per the RAM constraint: the
    /// per-cycle working slice plus KV bookkeeping must fit
    fn max_layers(&self, config: &PlannerConfig, cycles: u32) -> u32 {
        let per_layer = config.kv_bytes_per_layer + config.layer_bytes / cycles as u64;
        if per_layer == 0 {
            return u32::MAX;
        }
        (self.ram_budget / per_layer) as u32
    }

    /// GPU-offload prefix for a given share
    fn gpu_layers(&self, config: &PlannerConfig, x: u32) -> u32 {
        if self.flops_gpu <= 0.0 || config.layer_bytes == 0 {
            return 0;
        }
        let fit = (self.profile.vram_free / config.layer_bytes) as u32;
        fit.min(x)
    }

    /// Estimated seconds for this device's full share of one token
    fn time(&self, config: &PlannerConfig, x: u32) -> f64 {
        let g = self.gpu_layers(config, x);
        let cpu_layers = (x - g) as f64;
        let compute = cpu_layers / self.flops_cpu
            + if g > 0 { g as f64 / self.flops_gpu } else { 0.0 };

        let mapped = x as u64 * config.layer_bytes;
        let spill = mapped.saturating_sub(self.effective_cache);
        let io = spill as f64 / self.profile.disk_read_bw;

        compute + io
    }
}

/// Critical path for a candidate split
fn t_token(models: &[DeviceModel], config: &PlannerConfig, xs: &[u32], cycles: u32) -> f64 {
    let worst = models
        .iter()
        .zip(xs)
        .map(|(m, &x)| m.time(config, x))
        .fold(0.0f64, f64::max);
    worst / cycles as f64 + config.ring_latency_s * cycles as f64
}

/// Split `x` layers into `cycles` contiguous near-equal slices
fn cycle_shares(x: u32, cycles: u32) -> Vec<u32> {
    let base = x / cycles;
    let extra = x % cycles;
    (0..cycles)
        .map(|c| base + if c < extra { 1 } else { 0 })
        .collect()
}

/// Solve the one-shot assignment.
///
/// `n_layers` is the model's layer count; `profiles[0]` is the head.
pub fn plan(
    n_layers: u32,
    profiles: &[DeviceProfile],
    config: &PlannerConfig,
) -> Result<Assignment> {
    if profiles.is_empty() {
        return Err(PlannerError::NoDevices);
    }
    if n_layers == 0 {
        return Err(PlannerError::NoLayers);
    }
    for p in profiles {
        p.validate().map_err(|reason| PlannerError::InvalidProfile {
            device: p.name.clone(),
            reason,
        })?;
    }

    let models: Vec<DeviceModel> = profiles
        .iter()
        .enumerate()
        .map(|(i, p)| {
            let weight = if i == 0 { config.master_priority } else { 1.0 };
            let reserve = if i == 0 { config.draft_model_bytes } else { 0 };
            let ram_budget = p.ram_free.saturating_sub(reserve);
            DeviceModel {
                profile: p,
                flops_cpu: p.flops_cpu * weight,
                flops_gpu: p.flops_gpu * weight,
                effective_cache: (ram_budget as f64
                    * config.disk_cache.coefficient(p.os_class))
                    as u64,
                ram_budget,
            }
        })
        .collect();

    let mut best: Option<(f64, Vec<u32>, u32)> = None;

    let cycle_min = config.cycle_min.max(1);
    for cycles in cycle_min..=config.cycle_max.max(cycle_min) {
        let caps: Vec<u32> = models
            .iter()
            .map(|m| m.max_layers(config, cycles))
            .collect();

        let total_cap: u64 = caps.iter().map(|&c| c as u64).sum();
        if total_cap < n_layers as u64 || caps.iter().any(|&c| c == 0) {
            // This cycle count cannot host the model. If no cycle count
            // can, the infeasibility diagnostic comes after the loop.
            continue;
        }

        let Some(xs) = initial_split(n_layers, &models, &caps) else {
            continue;
        };
        let xs = descend(xs, &models, config, &caps, cycles);
        let t = t_token(&models, config, &xs, cycles);

        let better = match &best {
            None => true,
            Some((t_best, xs_best, _)) => {
                t < *t_best - 1e-12
                    || ((t - t_best).abs() <= 1e-12 && prefer(&xs, xs_best, &models))
            }
        };
        if better {
            best = Some((t, xs, cycles));
        }
    }

    let Some((t, xs, cycles)) = best else {
        // find the tightest-binding device at C = cycle_max
        let cycles = config.cycle_max.max(1);
        let tightest = models
            .iter()
            .min_by_key(|m| m.max_layers(config, cycles))
            .unwrap();
        let need = config.kv_bytes_per_layer + config.layer_bytes / cycles as u64;
        return Err(PlannerError::Infeasible {
            device: tightest.profile.name.clone(),
            need_bytes: need,
            have_bytes: tightest.ram_budget,
        });
    };

    let gpu_layers: Vec<u32> = models
        .iter()
        .zip(&xs)
        .map(|(m, &x)| m.gpu_layers(config, x))
        .collect();

    let mut windows = Vec::new();
    let shares: Vec<Vec<u32>> = xs.iter().map(|&x| cycle_shares(x, cycles)).collect();
    let mut next = 0u32;
    for cycle in 0..cycles {
        for (node, share) in shares.iter().enumerate() {
            let len = share[cycle as usize];
            windows.push(LayerWindow {
                node,
                cycle,
                begin: next,
                end: next + len,
            });
            next += len;
        }
    }

    let assignment = Assignment {
        n_layers,
        cycles,
        layer_counts: xs,
        gpu_layers,
        windows,
    };
    debug_assert!(assignment.validate().is_ok());

    tracing::info!(
        cycles,
        t_token_est_ms = t * 1e3,
        counts = ?assignment.layer_counts,
        gpu = ?assignment.gpu_layers,
        "workload plan"
    );

    Ok(assignment)
}

/// Seed split: proportional to best throughput, clamped to caps, forced to
/// sum to `n_layers` with every node holding at least one layer
fn initial_split(n_layers: u32, models: &[DeviceModel], caps: &[u32]) -> Option<Vec<u32>> {
    let total_flops: f64 = models.iter().map(|m| m.flops_cpu.max(m.flops_gpu)).sum();
    let mut xs: Vec<u32> = models
        .iter()
        .zip(caps)
        .map(|(m, &cap)| {
            let share =
                (n_layers as f64 * m.flops_cpu.max(m.flops_gpu) / total_flops).round() as u32;
            share.clamp(1, cap)
        })
        .collect();

    // repair the sum within caps
    loop {
        let sum: u32 = xs.iter().sum();
        if sum == n_layers {
            return Some(xs);
        }
        if sum < n_layers {
            // grow the device with the most headroom
            let (i, _) = xs
                .iter()
                .enumerate()
                .filter(|(i, &x)| x < caps[*i])
                .max_by_key(|(i, &x)| caps[*i] - x)?;
            xs[i] += 1;
        } else {
            // shrink the device with the largest share
            let (i, _) = xs
                .iter()
                .enumerate()
                .filter(|(_, &x)| x > 1)
                .max_by_key(|(_, &x)| x)?;
            xs[i] -= 1;
        }
    }
}

/// Move single layers away from the critical device while it helps
fn descend(
    mut xs: Vec<u32>,
    models: &[DeviceModel],
    config: &PlannerConfig,
    caps: &[u32],
    cycles: u32,
) -> Vec<u32> {
    let n = xs.len();
    loop {
        let t_now = t_token(models, config, &xs, cycles);
        let mut improved = false;

        for from in 0..n {
            if xs[from] <= 1 {
                continue;
            }
            for to in 0..n {
                if to == from || xs[to] >= caps[to] {
                    continue;
                }
                xs[from] -= 1;
                xs[to] += 1;
                let t_new = t_token(models, config, &xs, cycles);
                if t_new < t_now - 1e-12 {
                    improved = true;
                    break;
                }
                xs[from] += 1;
                xs[to] -= 1;
            }
            if improved {
                break;
            }
        }

        if !improved {
            return xs;
        }
    }
}

/// Prefetch horizon for one device: enough tiles ahead that expected
/// disk time for the window covers the compute time of one less tile
pub fn prefetch_horizon(profile: &DeviceProfile, config: &PlannerConfig) -> usize {
    let compute_per_tile = 1.0 / profile.best_flops().max(f64::MIN_POSITIVE);
    let disk_per_tile = config.layer_bytes as f64 / profile.disk_read_bw.max(1.0);

    // smallest h with h * disk <= (h - 1) * compute is unbounded when the
    // disk is the slower side; clamp to a small window either way
    let ratio = disk_per_tile / compute_per_tile.max(f64::MIN_POSITIVE);
    (ratio.ceil() as usize + 1).clamp(1, 8)
}

/// Tie-break: smaller max share first, then more layers on faster disks
fn prefer(a: &[u32], b: &[u32], models: &[DeviceModel]) -> bool {
    let max_a = a.iter().max().copied().unwrap_or(0);
    let max_b = b.iter().max().copied().unwrap_or(0);
    if max_a != max_b {
        return max_a < max_b;
    }

    let weight = |xs: &[u32]| -> f64 {
        xs.iter()
            .zip(models)
            .map(|(&x, m)| x as f64 * m.profile.disk_read_bw)
            .sum()
    };
    weight(a) > weight(b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::OsClass;

    fn device(name: &str, flops: f64, ram_gb: u64, vram_gb: u64) -> DeviceProfile {
        DeviceProfile {
            name: name.into(),
            flops_cpu: flops,
            flops_gpu: if vram_gb > 0 { flops * 4.0 } else { 0.0 },
            ram_free: ram_gb << 30,
            vram_free: vram_gb << 30,
            disk_read_bw: 500e6,
            os_class: OsClass::Linux,
            has_uma: false,
        }
    }

    fn small_config() -> PlannerConfig {
        PlannerConfig {
            layer_bytes: 64 << 20,
            kv_bytes_per_layer: 1 << 20,
            cycle_max: 1,
            ..PlannerConfig::default()
        }
    }

    #[test]
    fn test_coverage_invariant() {
        let profiles = vec![
            device("a", 2.0, 8, 0),
            device("b", 4.0, 8, 0),
            device("c", 8.0, 16, 8),
        ];
        let assignment = plan(32, &profiles, &small_config()).unwrap();

        assignment.validate().unwrap();
        assert_eq!(assignment.layer_counts.iter().sum::<u32>(), 32);
    }

    #[test]
    fn test_heterogeneous_cluster() {
        // the S6 shape: four devices, strong D3 gets the most layers
        let profiles = vec![
            device("d1", 1.0, 2, 0),
            device("d2", 4.0, 4, 8),
            device("d3", 8.0, 10, 11),
            device("d4", 1.0, 2, 0),
        ];
        let config = PlannerConfig {
            layer_bytes: 100 << 20,
            kv_bytes_per_layer: 1 << 20,
            cycle_max: 1,
            ..PlannerConfig::default()
        };

        let assignment = plan(80, &profiles, &config).unwrap();
        assignment.validate().unwrap();

        assert_eq!(assignment.layer_counts.iter().sum::<u32>(), 80);
        assert!(assignment.layer_counts[2] > assignment.layer_counts[0]);
        assert!(assignment.layer_counts[2] > assignment.layer_counts[3]);

        // RAM respected
        for (i, profile) in profiles.iter().enumerate() {
            let x = assignment.layer_counts[i] as u64;
            assert!(x * (config.layer_bytes + config.kv_bytes_per_layer) <= profile.ram_free + config.layer_bytes);
        }
    }

    #[test]
    fn test_infeasible_names_tightest_device() {
        let profiles = vec![
            device("big", 4.0, 8, 0),
            DeviceProfile {
                name: "tiny-phone".into(),
                flops_cpu: 0.5,
                flops_gpu: 0.0,
                ram_free: 1 << 20,
                vram_free: 0,
                disk_read_bw: 50e6,
                os_class: OsClass::Android,
                has_uma: false,
            },
        ];
        let config = PlannerConfig {
            layer_bytes: 1 << 30,
            kv_bytes_per_layer: 1 << 20,
            cycle_max: 2,
            ..PlannerConfig::default()
        };

        let err = plan(80, &profiles, &config).unwrap_err();
        match err {
            PlannerError::Infeasible { device, .. } => assert_eq!(device, "tiny-phone"),
            other => panic!("expected Infeasible, got {other}"),
        }
    }

    #[test]
    fn test_master_priority_bias() {
        let profiles = vec![device("head", 4.0, 16, 0), device("worker", 4.0, 16, 0)];

        let plan_with = |priority: f64| {
            let config = PlannerConfig {
                master_priority: priority,
                ..small_config()
            };
            plan(33, &profiles, &config).unwrap().layer_counts
        };

        // equal devices: the priority knob decides who gets the odd layer
        let favoured = plan_with(1.5);
        let deprioritised = plan_with(0.5);
        assert!(favoured[0] >= deprioritised[0]);
    }

    #[test]
    fn test_multi_cycle_windows() {
        let profiles = vec![device("a", 4.0, 1, 0), device("b", 4.0, 1, 0)];
        let config = PlannerConfig {
            layer_bytes: 32 << 20,
            kv_bytes_per_layer: 1 << 10,
            cycle_max: 4,
            ring_latency_s: 1e-6,
            ..PlannerConfig::default()
        };

        // negligible ring latency: extra cycles divide the critical path
        // almost for free, so the solver pipelines
        let assignment = plan(64, &profiles, &config).unwrap();
        assignment.validate().unwrap();
        assert!(assignment.cycles > 1);

        // traversal order is cycle-major
        for (i, w) in assignment.windows.iter().enumerate() {
            let expected_cycle = (i / 2) as u32;
            assert_eq!(w.cycle, expected_cycle);
            assert_eq!(w.node, i % 2);
        }
    }

    #[test]
    fn test_draft_reservation_can_make_head_infeasible() {
        let profiles = vec![device("head", 4.0, 2, 0), device("worker", 4.0, 2, 0)];
        let mut config = PlannerConfig {
            layer_bytes: 100 << 20,
            kv_bytes_per_layer: 1 << 20,
            cycle_max: 1,
            ..PlannerConfig::default()
        };

        assert!(plan(32, &profiles, &config).is_ok());

        // draft model eats the head's RAM
        config.draft_model_bytes = 2 << 30;
        let err = plan(32, &profiles, &config).unwrap_err();
        match err {
            PlannerError::Infeasible { device, .. } => assert_eq!(device, "head"),
            other => panic!("expected Infeasible, got {other}"),
        }
    }

    #[test]
    fn test_prefetch_horizon_scales_with_disk() {
        let config = PlannerConfig {
            layer_bytes: 1 << 30,
            ..PlannerConfig::default()
        };

        let mut fast_disk = device("fast", 1.0, 64, 0);
        fast_disk.disk_read_bw = 10e9;
        let mut slow_disk = device("slow", 1.0, 64, 0);
        slow_disk.disk_read_bw = 100e6;

        let h_fast = prefetch_horizon(&fast_disk, &config);
        let h_slow = prefetch_horizon(&slow_disk, &config);
        assert!(h_slow >= h_fast);
        assert!((1..=8).contains(&h_fast));
        assert!((1..=8).contains(&h_slow));
    }

    #[test]
    fn test_single_node() {
        let profiles = vec![device("solo", 8.0, 64, 0)];
        let assignment = plan(32, &profiles, &small_config()).unwrap();
        assert_eq!(assignment.layer_counts, vec![32]);
        assert_eq!(assignment.windows.len(), 1);
        assert_eq!(assignment.window(0, 0).unwrap().len(), 32);
    }
}
