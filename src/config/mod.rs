//! Configuration module for StocksBot.
//!
//! This module provides structured configuration loading from environment variables,
//! organized by concern: Runner, Scheduler, Safety, and Observability.

mod observability_config;
mod runner_config;
mod safety_config;
mod scheduler_config;

pub use observability_config::ObservabilityEnvConfig;
pub use runner_config::RunnerEnvConfig;
pub use safety_config::SafetyEnvConfig;
pub use scheduler_config::{SchedulerEnvConfig, default_max_workers};

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::env;
use std::str::FromStr;

const DEFAULT_DATABASE_URL: &str = "sqlite://data/stocksbot.db";

/// Main application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub runner: RunnerEnvConfig,
    pub scheduler: SchedulerEnvConfig,
    pub safety: SafetyEnvConfig,
    pub observability: ObservabilityEnvConfig,
    pub database_url: String,
    /// Opening cash of the paper broker
    pub paper_starting_cash: Decimal,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            runner: RunnerEnvConfig::default(),
            scheduler: SchedulerEnvConfig::default(),
            safety: SafetyEnvConfig::default(),
            observability: ObservabilityEnvConfig::default(),
            database_url: DEFAULT_DATABASE_URL.to_string(),
            paper_starting_cash: dec!(100000),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let runner = RunnerEnvConfig::from_env().context("Failed to load runner config")?;
        let scheduler = SchedulerEnvConfig::from_env().context("Failed to load scheduler config")?;
        let safety = SafetyEnvConfig::from_env().context("Failed to load safety config")?;
        let observability =
            ObservabilityEnvConfig::from_env().context("Failed to load observability config")?;

        Ok(Self {
            runner,
            scheduler,
            safety,
            observability,
            database_url: env::var("DATABASE_URL")
                .unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string()),
            paper_starting_cash: parse_decimal("PAPER_STARTING_CASH", dec!(100000))?,
        })
    }
}

fn parse_env<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr + ToString,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    env::var(key)
        .unwrap_or_else(|_| default.to_string())
        .parse::<T>()
        .context(format!("Failed to parse {}", key))
}

pub(crate) fn parse_u64(key: &str, default: u64) -> Result<u64> {
    parse_env(key, default)
}

pub(crate) fn parse_usize(key: &str, default: usize) -> Result<usize> {
    parse_env(key, default)
}

pub(crate) fn parse_decimal(key: &str, default: Decimal) -> Result<Decimal> {
    parse_env(key, default)
}

/// Unset or unrecognized values fall back to `default`
pub(crate) fn parse_bool(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(v) => match v.trim().to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            _ => default,
        },
        Err(_) => default,
    }
}
