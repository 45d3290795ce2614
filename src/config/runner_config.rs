//! Strategy runner configuration parsing from environment variables.

use super::{parse_bool, parse_u64};
use anyhow::Result;
use std::time::Duration;

/// Runner environment configuration
#[derive(Debug, Clone, PartialEq)]
pub struct RunnerEnvConfig {
    pub tick_interval_seconds: u64,
    /// Bound on every broker or market data call made inside a tick
    pub upstream_timeout_ms: u64,
    /// Checkpoint cadence while the mode is unchanged
    pub persist_every_ticks: u64,
    /// Compare broker positions with persisted ones after waking up
    pub reconcile_on_resume: bool,
}

impl Default for RunnerEnvConfig {
    fn default() -> Self {
        Self {
            tick_interval_seconds: 60,
            upstream_timeout_ms: 10_000,
            persist_every_ticks: 10,
            reconcile_on_resume: true,
        }
    }
}

impl RunnerEnvConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            tick_interval_seconds: parse_u64("RUNNER_TICK_INTERVAL_SECONDS", 60)?.max(1),
            upstream_timeout_ms: parse_u64("RUNNER_UPSTREAM_TIMEOUT_MS", 10_000)?.max(1),
            persist_every_ticks: parse_u64("RUNNER_STATE_PERSIST_EVERY_TICKS", 10)?.max(1),
            reconcile_on_resume: parse_bool("RUNNER_RECONCILE_ON_RESUME", true),
        })
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_millis(self.upstream_timeout_ms)
    }
}
