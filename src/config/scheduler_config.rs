//! Optimization scheduler configuration parsing from environment variables.

use super::{parse_u64, parse_usize};
use anyhow::Result;
use std::time::Duration;

/// Optimization scheduler environment configuration
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerEnvConfig {
    /// Global worker ceiling shared by jobs and their ensemble sub-pools
    pub max_workers: usize,
    /// Jobs allowed to wait beyond the running ones
    pub queue_capacity: usize,
    pub stall_threshold_seconds: u64,
    pub force_cancel_grace_seconds: u64,
    /// Minimum spacing of mid-iteration heartbeats
    pub heartbeat_slice_ms: u64,
}

impl Default for SchedulerEnvConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(available_cpus()),
            queue_capacity: 32,
            stall_threshold_seconds: 120,
            force_cancel_grace_seconds: 10,
            heartbeat_slice_ms: 2_000,
        }
    }
}

fn available_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Leave one core for the runner, use at most 4 by default, never more than 6
pub fn default_max_workers(cpus: usize) -> usize {
    let cpus = cpus.max(1);
    cpus.saturating_sub(1).clamp(1, 4).min(6.min(cpus))
}

impl SchedulerEnvConfig {
    pub fn from_env() -> Result<Self> {
        let cpus = available_cpus();
        let max_workers = parse_usize("OPTIMIZER_MAX_WORKERS", default_max_workers(cpus))?;
        Ok(Self {
            max_workers: max_workers.clamp(1, 6.min(cpus)),
            queue_capacity: parse_usize("OPTIMIZER_QUEUE_CAPACITY", 32)?,
            stall_threshold_seconds: parse_u64("OPTIMIZER_STALL_THRESHOLD_SECONDS", 120)?,
            force_cancel_grace_seconds: parse_u64("OPTIMIZER_FORCE_CANCEL_GRACE_SECONDS", 10)?,
            heartbeat_slice_ms: parse_u64("OPTIMIZER_HEARTBEAT_SLICE_MS", 2_000)?.max(1),
        })
    }

    pub fn stall_threshold(&self) -> Duration {
        Duration::from_secs(self.stall_threshold_seconds)
    }

    pub fn force_cancel_grace(&self) -> Duration {
        Duration::from_secs(self.force_cancel_grace_seconds)
    }

    pub fn heartbeat_slice(&self) -> Duration {
        Duration::from_millis(self.heartbeat_slice_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_max_workers_by_core_count() {
        assert_eq!(default_max_workers(1), 1);
        assert_eq!(default_max_workers(2), 1);
        assert_eq!(default_max_workers(4), 3);
        assert_eq!(default_max_workers(16), 4);
    }
}
