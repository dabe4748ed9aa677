//! Device profiles collected once at bring-up

use serde::{Deserialize, Serialize};

/// Page-management behaviour class of a device's OS.
///
/// Sequential-reader OSes aggressively read ahead and keep more of a
/// memory-mapped model resident; random-reader ones evict sooner under
/// the same pressure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OsClass {
    Linux,
    Macos,
    Windows,
    Android,
}

/// Effective-cache coefficients per OS class: the fraction of free RAM the
/// planner assumes stays resident for mapped tiles. Heuristics, exposed as
/// configuration rather than constants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskCacheModel {
    pub linux: f64,
    pub macos: f64,
    pub windows: f64,
    pub android: f64,
}

impl Default for DiskCacheModel {
    fn default() -> Self {
        Self {
            linux: 0.8,
            macos: 0.7,
            windows: 0.5,
            android: 0.4,
        }
    }
}

impl DiskCacheModel {
    pub fn coefficient(&self, os: OsClass) -> f64 {
        match os {
            OsClass::Linux => self.linux,
            OsClass::Macos => self.macos,
            OsClass::Windows => self.windows,
            OsClass::Android => self.android,
        }
    }
}

/// What one device reports about itself at bring-up
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceProfile {
    /// Human-readable name, used in diagnostics
    pub name: String,
    /// Sustained CPU throughput, layer-steps per second equivalent
    pub flops_cpu: f64,
    /// Sustained GPU throughput; 0 when no accelerator
    pub flops_gpu: f64,
    /// Free host memory in bytes
    pub ram_free: u64,
    /// Free accelerator memory in bytes; 0 when no accelerator
    pub vram_free: u64,
    /// Sustained disk read bandwidth, bytes per second
    pub disk_read_bw: f64,
    /// Page-management class
    pub os_class: OsClass,
    /// Whether accelerator and host share one address space
    pub has_uma: bool,
}

impl DeviceProfile {
    /// Validate the numbers a device reported
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.flops_cpu <= 0.0 {
            return Err("flops_cpu must be positive".into());
        }
        if self.flops_gpu < 0.0 || self.disk_read_bw <= 0.0 {
            return Err("flops_gpu and disk_read_bw must be non-negative".into());
        }
        Ok(())
    }

    /// Best available throughput for one layer step
    pub fn best_flops(&self) -> f64 {
        self.flops_cpu.max(self.flops_gpu)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_coefficient_ordering() {
        let model = DiskCacheModel::default();
        assert!(model.coefficient(OsClass::Linux) > model.coefficient(OsClass::Windows));
        assert!(model.coefficient(OsClass::Windows) > model.coefficient(OsClass::Android));
    }

    #[test]
    fn test_profile_validation() {
        let mut profile = DeviceProfile {
            name: "laptop".into(),
            flops_cpu: 4.0,
            flops_gpu: 0.0,
            ram_free: 8 << 30,
            vram_free: 0,
            disk_read_bw: 500e6,
            os_class: OsClass::Linux,
            has_uma: false,
        };
        assert!(profile.validate().is_ok());

        profile.flops_cpu = 0.0;
        assert!(profile.validate().is_err());
    }
}
