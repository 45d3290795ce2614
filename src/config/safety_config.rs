//! Safety and order guardrail configuration parsing from environment variables.

use super::{parse_decimal, parse_u64, parse_usize};
use anyhow::Result;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::time::Duration;

/// Safety environment configuration
#[derive(Debug, Clone, PartialEq)]
pub struct SafetyEnvConfig {
    pub max_orders_per_minute: usize,
    /// Notional cap per position
    pub max_position_size: Decimal,
    /// Realized loss per UTC day after which new buys are refused
    pub daily_risk_limit: Decimal,
    pub liquidation_max_retries: u32,
    pub liquidation_base_delay_ms: u64,
    /// Bound on each broker call made while liquidating
    pub broker_timeout_ms: u64,
}

impl Default for SafetyEnvConfig {
    fn default() -> Self {
        Self {
            max_orders_per_minute: 60,
            max_position_size: dec!(10000),
            daily_risk_limit: dec!(500),
            liquidation_max_retries: 3,
            liquidation_base_delay_ms: 500,
            broker_timeout_ms: 10_000,
        }
    }
}

impl SafetyEnvConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            max_orders_per_minute: parse_usize("SAFETY_MAX_ORDERS_PER_MINUTE", 60)?.max(1),
            max_position_size: parse_decimal("SAFETY_MAX_POSITION_SIZE", dec!(10000))?,
            daily_risk_limit: parse_decimal("SAFETY_DAILY_RISK_LIMIT", dec!(500))?,
            liquidation_max_retries: parse_u64("SAFETY_LIQUIDATION_MAX_RETRIES", 3)?.min(10) as u32,
            liquidation_base_delay_ms: parse_u64("SAFETY_LIQUIDATION_BASE_DELAY_MS", 500)?,
            broker_timeout_ms: parse_u64("SAFETY_BROKER_TIMEOUT_MS", 10_000)?.max(1),
        })
    }

    pub fn liquidation_base_delay(&self) -> Duration {
        Duration::from_millis(self.liquidation_base_delay_ms)
    }

    pub fn broker_timeout(&self) -> Duration {
        Duration::from_millis(self.broker_timeout_ms)
    }

    /// Daily risk limit scaled to the account: at most 5% of equity, never
    /// under 50, never above the configured limit
    pub fn effective_daily_risk_limit(&self, equity: Decimal) -> Decimal {
        let mut limit = self.daily_risk_limit;
        if equity > Decimal::ZERO {
            limit = limit.min(dec!(50).max(equity * dec!(0.05)));
        }
        limit.max(Decimal::ONE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_daily_risk_limit_scales_with_equity() {
        let config = SafetyEnvConfig::default();
        assert_eq!(config.effective_daily_risk_limit(dec!(100000)), dec!(500));
        assert_eq!(config.effective_daily_risk_limit(dec!(4000)), dec!(200));
        assert_eq!(config.effective_daily_risk_limit(dec!(200)), dec!(50));
        assert_eq!(config.effective_daily_risk_limit(Decimal::ZERO), dec!(500));

        let tiny = SafetyEnvConfig {
            daily_risk_limit: dec!(0.2),
            ..SafetyEnvConfig::default()
        };
        assert_eq!(tiny.effective_daily_risk_limit(Decimal::ZERO), Decimal::ONE);
    }
}
