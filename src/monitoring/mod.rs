//! Resource gauges behind `heartbeat:pong`/`agent:status` (§10.3) and the
//! admission-gating health check in §4.9(b). Samples process-level CPU and
//! memory on the same cadence as the heartbeat.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

#[derive(Debug, Clone, Copy)]
pub struct ResourceSnapshot {
    pub cpu_percent: f64,
    pub memory_mb: f64,
    pub sampled_at: i64,
}

/// High-water marks past which the agent reports a degraded `resourceStatus`
/// and the admission gate starts rejecting new tasks outright.
#[derive(Debug, Clone, Copy)]
pub struct HealthThresholds {
    pub cpu_degraded_percent: f64,
    pub memory_degraded_mb: f64,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            cpu_degraded_percent: 90.0,
            memory_degraded_mb: 4096.0,
        }
    }
}

/// Minimal process-resource sampler. Reads `/proc/self/stat` and
/// `/proc/self/status` on Linux; falls back to zeroed gauges elsewhere so the
/// heartbeat/admission paths never block on platform-specific APIs.
pub struct ResourceSampler {
    last_cpu_ticks: AtomicU64,
    last_sample: std::sync::Mutex<Instant>,
}

impl ResourceSampler {
    pub fn new() -> Self {
        Self {
            last_cpu_ticks: AtomicU64::new(0),
            last_sample: std::sync::Mutex::new(Instant::now()),
        }
    }

    pub fn sample(&self) -> ResourceSnapshot {
        let (cpu_percent, memory_mb) = self.read_proc().unwrap_or((0.0, 0.0));
        ResourceSnapshot {
            cpu_percent,
            memory_mb,
            sampled_at: crate::now_ms(),
        }
    }

    #[cfg(target_os = "linux")]
    fn read_proc(&self) -> Option<(f64, f64)> {
        let status = std::fs::read_to_string("/proc/self/status").ok()?;
        let memory_kb = status
            .lines()
            .find(|l| l.starts_with("VmRSS:"))
            .and_then(|l| l.split_whitespace().nth(1))
            .and_then(|v| v.parse::<f64>().ok())?;

        let stat = std::fs::read_to_string("/proc/self/stat").ok()?;
        let fields: Vec<&str> = stat.rsplit(')').next()?.split_whitespace().collect();
        // utime (14th overall) and stime (15th) are fields[11] and [12] after the comm field split.
        let utime: u64 = fields.get(11)?.parse().ok()?;
        let stime: u64 = fields.get(12)?.parse().ok()?;
        let total_ticks = utime + stime;

        let mut last_sample = self.last_sample.lock().ok()?;
        let elapsed = last_sample.elapsed().as_secs_f64().max(0.001);
        let prev_ticks = self.last_cpu_ticks.swap(total_ticks, Ordering::SeqCst);
        *last_sample = Instant::now();

        let clock_ticks_per_sec = 100.0; // USER_HZ is 100 on virtually all Linux builds.
        let delta_ticks = total_ticks.saturating_sub(prev_ticks) as f64;
        let cpu_percent = (delta_ticks / clock_ticks_per_sec) / elapsed * 100.0;

        Some((cpu_percent, memory_kb / 1024.0))
    }

    #[cfg(not(target_os = "linux"))]
    fn read_proc(&self) -> Option<(f64, f64)> {
        None
    }
}

impl Default for ResourceSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceSnapshot {
    pub fn degraded(&self, thresholds: &HealthThresholds) -> bool {
        self.cpu_percent >= thresholds.cpu_degraded_percent
            || self.memory_mb >= thresholds.memory_degraded_mb
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sampler_never_panics_even_without_proc() {
        let sampler = ResourceSampler::new();
        let snapshot = sampler.sample();
        assert!(snapshot.cpu_percent >= 0.0);
    }

    #[test]
    fn degraded_trips_on_memory_threshold() {
        let snapshot = ResourceSnapshot {
            cpu_percent: 1.0,
            memory_mb: 8192.0,
            sampled_at: 0,
        };
        assert!(snapshot.degraded(&HealthThresholds::default()));
    }
}
