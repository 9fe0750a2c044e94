//! Resource usage arithmetic for container stats samples.

use serde::Serialize;

/// Cumulative CPU counters from one stats sample.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CpuSample {
    /// Cumulative container CPU time, in nanoseconds.
    pub total_usage: u64,
    /// Cumulative host CPU time, in nanoseconds.
    pub system_usage: u64,
    /// Cores visible to the container.
    pub online_cpus: u32,
}

/// CPU usage between two adjacent samples, as a percentage of one core.
///
/// Result lies in `[0, 100 * cores]`. Counter resets and idle hosts yield 0.
#[allow(clippy::cast_precision_loss)]
pub fn cpu_percent(previous: &CpuSample, current: &CpuSample) -> f64 {
    let cpu_delta = current.total_usage.saturating_sub(previous.total_usage);
    let system_delta = current.system_usage.saturating_sub(previous.system_usage);
    if cpu_delta == 0 || system_delta == 0 {
        return 0.0;
    }
    let cores = f64::from(current.online_cpus.max(1));
    let percent = (cpu_delta as f64 / system_delta as f64) * cores * 100.0;
    percent.clamp(0.0, 100.0 * cores)
}

/// Memory usage as a percentage of the limit, in `[0, 100]`.
#[allow(clippy::cast_precision_loss)]
pub fn memory_percent(usage: u64, limit: u64) -> f64 {
    if limit == 0 {
        return 0.0;
    }
    ((usage as f64 / limit as f64) * 100.0).clamp(0.0, 100.0)
}
