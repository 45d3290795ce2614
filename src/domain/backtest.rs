use crate::domain::errors::SimulationError;
use crate::domain::optimization::parameters::StrategyParameters;
use crate::domain::performance::metrics::BacktestMetrics;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Inclusive calendar range of trading sessions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self, SimulationError> {
        if start > end {
            return Err(SimulationError::InvalidRange {
                start: start.to_string(),
                end: end.to_string(),
            });
        }
        Ok(Self { start, end })
    }

    /// Calendar days covered, both ends included
    pub fn days(&self) -> i64 {
        (self.end - self.start).num_days() + 1
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        date >= self.start && date <= self.end
    }
}

impl fmt::Display for DateRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.start, self.end)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ContributionFrequency {
    #[default]
    None,
    Weekly,
    Monthly,
}

/// Starting capital plus optional recurring contributions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapitalSchedule {
    pub initial_capital: Decimal,
    #[serde(default)]
    pub contribution_amount: Decimal,
    #[serde(default)]
    pub contribution_frequency: ContributionFrequency,
}

impl CapitalSchedule {
    pub fn lump_sum(initial_capital: Decimal) -> Self {
        Self {
            initial_capital,
            contribution_amount: Decimal::ZERO,
            contribution_frequency: ContributionFrequency::None,
        }
    }
}

impl Default for CapitalSchedule {
    fn default() -> Self {
        Self::lump_sum(dec!(100000))
    }
}

/// Fill cost assumptions applied to every simulated fill
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostModel {
    /// Commission in basis points of notional
    pub fee_bps: Decimal,
    /// Fixed slippage in basis points, always against the trader
    pub slippage_bps: Decimal,
    /// Upper bound of the seeded random slippage added per fill
    #[serde(default)]
    pub slippage_jitter_bps: Decimal,
    /// Hard cap on notional per position
    #[serde(default)]
    pub max_position_size: Option<Decimal>,
    /// Seed for slippage jitter
    #[serde(default)]
    pub seed: u64,
}

impl Default for CostModel {
    fn default() -> Self {
        Self {
            fee_bps: dec!(0),
            slippage_bps: dec!(5),
            slippage_jitter_bps: dec!(0),
            max_position_size: None,
            seed: 42,
        }
    }
}

/// Typed view over the parameter map consumed by the simulator
#[derive(Debug, Clone, PartialEq)]
pub struct BacktestParameters {
    pub position_size: Decimal,
    pub stop_loss_pct: Decimal,
    pub take_profit_pct: Decimal,
    pub risk_per_trade_pct: Decimal,
    pub trailing_stop_pct: Decimal,
    pub atr_stop_mult: Decimal,
    pub zscore_entry_threshold: f64,
    pub dip_buy_threshold_pct: Decimal,
    pub max_hold_days: i64,
    pub dca_tranches: u32,
    pub max_consecutive_losses: u32,
    pub max_drawdown_pct: Decimal,
    pub lookback_period: usize,
}

impl BacktestParameters {
    pub fn from_parameters(params: &StrategyParameters) -> Result<Self, SimulationError> {
        let decimal = |name: &str, default: f64| -> Result<Decimal, SimulationError> {
            let value = params.value_or(name, default);
            Decimal::from_f64(value).ok_or_else(|| SimulationError::InvalidParameters {
                reason: format!("{} is not a finite number", name),
            })
        };

        let parsed = Self {
            position_size: decimal("position_size", 1000.0)?,
            stop_loss_pct: decimal("stop_loss_pct", 2.0)?,
            take_profit_pct: decimal("take_profit_pct", 5.0)?,
            risk_per_trade_pct: decimal("risk_per_trade", 1.0)?,
            trailing_stop_pct: decimal("trailing_stop_pct", 2.5)?,
            atr_stop_mult: decimal("atr_stop_mult", 2.0)?,
            zscore_entry_threshold: params.value_or("zscore_entry_threshold", -1.2),
            dip_buy_threshold_pct: decimal("dip_buy_threshold_pct", 1.5)?,
            max_hold_days: params.value_or("max_hold_days", 10.0).round() as i64,
            dca_tranches: params.value_or("dca_tranches", 1.0).round().max(1.0) as u32,
            max_consecutive_losses: params.value_or("max_consecutive_losses", 3.0).round().max(1.0)
                as u32,
            max_drawdown_pct: decimal("max_drawdown_pct", 15.0)?,
            lookback_period: params.value_or("lookback_period", 20.0).round().max(2.0) as usize,
        };
        parsed.validate()?;
        Ok(parsed)
    }

    fn validate(&self) -> Result<(), SimulationError> {
        let invalid = |reason: String| Err(SimulationError::InvalidParameters { reason });
        if self.position_size <= Decimal::ZERO {
            return invalid(format!("position_size must be positive, got {}", self.position_size));
        }
        if self.stop_loss_pct <= Decimal::ZERO || self.take_profit_pct <= Decimal::ZERO {
            return invalid("stop_loss_pct and take_profit_pct must be positive".to_string());
        }
        if self.max_hold_days < 1 {
            return invalid(format!("max_hold_days must be at least 1, got {}", self.max_hold_days));
        }
        if !self.zscore_entry_threshold.is_finite() {
            return invalid("zscore_entry_threshold is not a finite number".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    StopLoss,
    TakeProfit,
    TrailingStop,
    TimeExit,
    EndOfBacktest,
}

/// One round trip produced by the simulator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulatedTrade {
    pub symbol: String,
    pub entry_date: NaiveDate,
    pub exit_date: NaiveDate,
    pub entry_price: Decimal,
    pub exit_price: Decimal,
    pub quantity: Decimal,
    pub pnl: Decimal,
    pub return_pct: f64,
    pub fees: Decimal,
    pub hold_days: i64,
    pub tranches: u32,
    pub exit_reason: ExitReason,
}

/// End-of-session account snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EquityPoint {
    pub date: NaiveDate,
    pub equity: Decimal,
    pub cash: Decimal,
    pub positions_value: Decimal,
    /// Cumulative capital paid in so far (initial plus contributions)
    pub contributed: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct BacktestDiagnostics {
    pub sessions: usize,
    pub contributions_made: u32,
    /// Entry attempts that were blocked, keyed by reason
    pub blocked_reasons: BTreeMap<String, u64>,
    /// Symbols with no bars at all inside the requested range
    pub symbols_without_data: Vec<String>,
    /// Symbols excluded from entries for short history, with bars available
    pub insufficient_data: BTreeMap<String, usize>,
}

impl BacktestDiagnostics {
    pub fn block(&mut self, reason: &str) {
        *self.blocked_reasons.entry(reason.to_string()).or_insert(0) += 1;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestResult {
    pub symbols: Vec<String>,
    pub date_range: DateRange,
    pub initial_capital: Decimal,
    pub total_contributed: Decimal,
    pub final_capital: Decimal,
    /// Net return on contributed capital, in percent
    pub total_return: f64,
    pub trades: Vec<SimulatedTrade>,
    pub equity_curve: Vec<EquityPoint>,
    pub metrics: BacktestMetrics,
    pub diagnostics: BacktestDiagnostics,
    /// Realized P&L per symbol
    pub symbol_pnl: BTreeMap<String, Decimal>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_date_range_rejects_inverted_bounds() {
        let a = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        let b = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        assert!(DateRange::new(a, b).is_err());
        let range = DateRange::new(b, a).unwrap();
        assert_eq!(range.days(), 61);
        assert!(range.contains(a));
    }

    #[test]
    fn test_parameters_fall_back_to_defaults() {
        let params = StrategyParameters::default();
        let parsed = BacktestParameters::from_parameters(&params).unwrap();
        assert_eq!(parsed.lookback_period, 20);
        assert_eq!(parsed.dca_tranches, 1);
        assert_eq!(parsed.stop_loss_pct, dec!(2));
    }

    #[test]
    fn test_parameters_reject_non_positive_size() {
        let mut params = StrategyParameters::default();
        params.set("position_size", 0.0);
        assert!(matches!(
            BacktestParameters::from_parameters(&params),
            Err(SimulationError::InvalidParameters { .. })
        ));
    }
}
