//! Host load sampling.
//!
//! [`HostMonitor`] keeps one sysinfo handle alive between `/status` requests,
//! so CPU usage is the delta since the previous sample rather than a
//! zero-length window. [`cpu_core_count`] sizes the default worker pool.

use serde::Serialize;
use sysinfo::{CpuRefreshKind, MemoryRefreshKind, RefreshKind, System};
use tokio::sync::Mutex;

/// Number of logical CPU cores, at least 1.
#[must_use]
pub fn cpu_core_count() -> usize {
    let system = System::new_with_specifics(RefreshKind::new().with_cpu(CpuRefreshKind::new()));
    system.cpus().len().max(1)
}

/// One reading of host CPU and RAM pressure, both in 0..=100.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HostLoad {
    pub cpu_percent: u8,
    pub memory_percent: u8,
}

impl HostLoad {
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn from_usage(cpu_usage: f32, used_memory: u64, total_memory: u64) -> Self {
        let cpu_percent = if cpu_usage.is_finite() {
            cpu_usage.clamp(0.0, 100.0).round() as u8
        } else {
            0
        };
        let memory_percent = used_memory
            .saturating_mul(100)
            .checked_div(total_memory)
            .map_or(0, |percent| percent.min(100) as u8);
        Self {
            cpu_percent,
            memory_percent,
        }
    }
}

fn sampled() -> RefreshKind {
    RefreshKind::new()
        .with_cpu(CpuRefreshKind::new().with_cpu_usage())
        .with_memory(MemoryRefreshKind::new().with_ram())
}

pub struct HostMonitor {
    system: Mutex<System>,
}

impl std::fmt::Debug for HostMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostMonitor").finish_non_exhaustive()
    }
}

impl Default for HostMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl HostMonitor {
    /// Take the baseline sample the first [`HostMonitor::sample`] diffs against.
    #[must_use]
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new_with_specifics(sampled())),
        }
    }

    pub async fn sample(&self) -> HostLoad {
        let mut system = self.system.lock().await;
        system.refresh_specifics(sampled());
        HostLoad::from_usage(
            system.global_cpu_info().cpu_usage(),
            system.used_memory(),
            system.total_memory(),
        )
    }
}
