use crate::domain::backtest::{CapitalSchedule, CostModel, DateRange};
use crate::domain::errors::OptimizationError;
use crate::domain::optimization::parameters::{BoundOverride, StrategyParameters};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Ranking function applied to backtest metrics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Objective {
    #[default]
    Balanced,
    Sharpe,
    Return,
}

impl Objective {
    pub fn label(&self) -> &'static str {
        match self {
            Objective::Balanced => "balanced_risk_adjusted",
            Objective::Sharpe => "sharpe_priority",
            Objective::Return => "return_priority",
        }
    }
}

impl fmt::Display for Objective {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Objective::Balanced => "balanced",
            Objective::Sharpe => "sharpe",
            Objective::Return => "return",
        };
        write!(f, "{}", name)
    }
}

impl FromStr for Objective {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "balanced" => Ok(Objective::Balanced),
            "sharpe" => Ok(Objective::Sharpe),
            "return" => Ok(Objective::Return),
            other => anyhow::bail!(
                "Unknown objective '{}': expected balanced, sharpe or return",
                other
            ),
        }
    }
}

fn default_iterations() -> usize {
    50
}

fn default_ensemble_runs() -> usize {
    8
}

fn default_walk_forward_folds() -> usize {
    4
}

fn default_top_k() -> usize {
    5
}

/// Parameter search experiment submitted for one strategy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationRequest {
    pub symbols: Vec<String>,
    pub date_range: DateRange,
    #[serde(default)]
    pub base_parameters: StrategyParameters,
    #[serde(default)]
    pub parameter_bounds: BTreeMap<String, BoundOverride>,
    #[serde(default = "default_iterations")]
    pub iterations: usize,
    #[serde(default)]
    pub objective: Objective,
    #[serde(default)]
    pub min_trades: usize,
    #[serde(default)]
    pub strict_min_trades: bool,
    #[serde(default)]
    pub capital: CapitalSchedule,
    #[serde(default)]
    pub cost_model: CostModel,
    #[serde(default)]
    pub random_seed: Option<u64>,
    /// Perturb the symbol subset per candidate (universes above 8 symbols only)
    #[serde(default)]
    pub vary_symbols: bool,
    /// Try progressively narrower universes for the winning parameters
    #[serde(default)]
    pub symbol_trim: bool,
    #[serde(default)]
    pub ensemble_mode: bool,
    #[serde(default = "default_ensemble_runs")]
    pub ensemble_runs: usize,
    /// Requested concurrency; capped by the scheduler's global ceiling
    #[serde(default)]
    pub max_workers: Option<usize>,
    #[serde(default)]
    pub walk_forward_enabled: bool,
    #[serde(default = "default_walk_forward_folds")]
    pub walk_forward_folds: usize,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
}

impl OptimizationRequest {
    pub fn new(symbols: Vec<String>, date_range: DateRange) -> Self {
        Self {
            symbols,
            date_range,
            base_parameters: StrategyParameters::default(),
            parameter_bounds: BTreeMap::new(),
            iterations: default_iterations(),
            objective: Objective::default(),
            min_trades: 0,
            strict_min_trades: false,
            capital: CapitalSchedule::default(),
            cost_model: CostModel::default(),
            random_seed: None,
            vary_symbols: false,
            symbol_trim: false,
            ensemble_mode: false,
            ensemble_runs: default_ensemble_runs(),
            max_workers: None,
            walk_forward_enabled: false,
            walk_forward_folds: default_walk_forward_folds(),
            top_k: default_top_k(),
        }
    }

    pub fn validate(&self) -> Result<(), OptimizationError> {
        let invalid = |reason: &str| {
            Err(OptimizationError::InvalidRequest {
                reason: reason.to_string(),
            })
        };
        if self.symbols.iter().all(|s| s.trim().is_empty()) {
            return invalid("at least one symbol is required");
        }
        if self.iterations == 0 {
            return invalid("iterations must be at least 1");
        }
        if self.ensemble_mode && self.ensemble_runs == 0 {
            return invalid("ensemble_runs must be at least 1");
        }
        if self.capital.initial_capital <= rust_decimal::Decimal::ZERO {
            return invalid("initial capital must be positive");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn range() -> DateRange {
        DateRange::new(
            NaiveDate::from_ymd_opt(2023, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(2023, 12, 31).unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn test_objective_parse_and_label() {
        assert_eq!("Sharpe".parse::<Objective>().unwrap(), Objective::Sharpe);
        assert_eq!(Objective::Return.label(), "return_priority");
        assert!("sortino".parse::<Objective>().is_err());
    }

    #[test]
    fn test_request_defaults_from_minimal_json() {
        let json = r#"{
            "symbols": ["AAPL"],
            "date_range": {"start": "2023-01-01", "end": "2023-12-31"}
        }"#;
        let request: OptimizationRequest = serde_json::from_str(json).unwrap();
        assert_eq!(request.iterations, 50);
        assert_eq!(request.ensemble_runs, 8);
        assert_eq!(request.walk_forward_folds, 4);
        assert_eq!(request.objective, Objective::Balanced);
        assert!(request.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_empty_symbols() {
        let request = OptimizationRequest::new(vec![" ".to_string()], range());
        assert!(request.validate().is_err());
    }
}
