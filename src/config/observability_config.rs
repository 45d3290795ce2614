//! Observability configuration parsing from environment variables.

use super::{parse_bool, parse_u64};
use anyhow::Result;

/// Observability environment configuration
#[derive(Debug, Clone, PartialEq)]
pub struct ObservabilityEnvConfig {
    pub enabled: bool,
    /// Seconds between `METRICS_JSON` snapshots
    pub interval_seconds: u64,
}

impl Default for ObservabilityEnvConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_seconds: 60,
        }
    }
}

impl ObservabilityEnvConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            enabled: parse_bool("OBSERVABILITY_ENABLED", true),
            interval_seconds: parse_u64("OBSERVABILITY_INTERVAL", 60)?.max(1),
        })
    }
}
