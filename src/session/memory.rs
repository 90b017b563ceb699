//! Process memory sampling.
//!
//! Pure query layer over `sysinfo`; the tiered sweep and the stats
//! surface both read through it. Sampling failures degrade to a zeroed
//! reading rather than an error so cleanup decisions always have a
//! number to work with.

use serde::Serialize;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use tracing::warn;

/// One point-in-time memory reading, all sizes in MiB.
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct MemoryReading {
    /// Resident set size of this process.
    pub rss_mb: f64,
    /// Virtual memory size of this process.
    pub vms_mb: f64,
    /// Resident set as a percentage of total system memory.
    pub percent: f64,
    /// System-wide available memory.
    pub available_mb: f64,
}

/// Source of memory readings. The production implementation is
/// [`MemoryMonitor`]; tests substitute fixed readings to drive the
/// pressure tiers deterministically.
pub trait MemorySource: Send + Sync {
    /// Take a fresh reading.
    fn sample(&self) -> MemoryReading;
}

/// Samples memory usage of the current process.
pub struct MemoryMonitor {
    pid: Pid,
}

impl Default for MemoryMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryMonitor {
    /// Monitor bound to the current process id.
    #[must_use]
    pub fn new() -> Self {
        Self {
            pid: Pid::from_u32(std::process::id()),
        }
    }

    /// Take a fresh reading. Returns zeros if the process cannot be
    /// sampled (never errors).
    #[must_use]
    pub fn sample(&self) -> MemoryReading {
        let refresh = ProcessRefreshKind::nothing().with_memory();
        let mut system = System::new();
        system.refresh_memory();
        system.refresh_processes_specifics(ProcessesToUpdate::Some(&[self.pid]), true, refresh);

        let Some(process) = system.process(self.pid) else {
            warn!(pid = self.pid.as_u32(), "own process not visible to sampler");
            return MemoryReading::default();
        };

        let to_mb = |bytes: u64| bytes_to_f64(bytes) / 1024.0 / 1024.0;
        let total = system.total_memory();
        let rss = process.memory();
        let percent = if total == 0 {
            0.0
        } else {
            bytes_to_f64(rss) / bytes_to_f64(total) * 100.0
        };

        MemoryReading {
            rss_mb: to_mb(rss),
            vms_mb: to_mb(process.virtual_memory()),
            percent,
            available_mb: to_mb(system.available_memory()),
        }
    }
}

impl MemorySource for MemoryMonitor {
    fn sample(&self) -> MemoryReading {
        MemoryMonitor::sample(self)
    }
}

#[allow(clippy::cast_precision_loss)]
fn bytes_to_f64(bytes: u64) -> f64 {
    bytes as f64
}
