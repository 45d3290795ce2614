use crate::domain::backtest::{BacktestResult, DateRange};
use crate::domain::optimization::parameters::StrategyParameters;
use crate::domain::performance::metrics::BacktestMetrics;
use serde::{Deserialize, Serialize};

/// Headline metrics used for ranking and reporting
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct CandidateMetrics {
    pub sharpe: f64,
    pub total_return: f64,
    pub max_drawdown: f64,
    pub win_rate: f64,
    pub total_trades: usize,
}

impl From<&BacktestMetrics> for CandidateMetrics {
    fn from(metrics: &BacktestMetrics) -> Self {
        Self {
            sharpe: metrics.sharpe_ratio,
            total_return: metrics.total_return_pct,
            max_drawdown: metrics.max_drawdown_pct,
            win_rate: metrics.win_rate,
            total_trades: metrics.total_trades,
        }
    }
}

/// Distribution summary over the perturbed scenarios of one candidate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnsembleStats {
    pub runs: usize,
    pub median_sharpe: f64,
    pub median_return: f64,
    pub p95_drawdown: f64,
    pub loss_probability_pct: f64,
}

/// One evaluated parameter vector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestCandidate {
    /// 1-based position in the final ranking, 0 while unranked
    pub rank: usize,
    pub iteration: usize,
    pub parameters: StrategyParameters,
    pub symbol_subset: Vec<String>,
    pub score: f64,
    pub metrics: CandidateMetrics,
    pub meets_min_trades: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ensemble: Option<EnsembleStats>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalkForwardFold {
    pub fold_index: usize,
    pub train_range: DateRange,
    pub test_range: DateRange,
    pub test_score: f64,
    pub test_metrics: CandidateMetrics,
    pub meets_min_trades: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalkForwardReport {
    pub folds_requested: usize,
    pub folds_completed: usize,
    pub pass_rate_pct: f64,
    pub average_score: f64,
    pub average_return: f64,
    pub average_sharpe: f64,
    /// Worst test-window return across every completed fold, passing or not
    pub worst_fold_return: Option<f64>,
    pub folds: Vec<WalkForwardFold>,
    pub notes: Vec<String>,
}

impl WalkForwardReport {
    pub fn skipped(folds_requested: usize, note: impl Into<String>) -> Self {
        Self::from_folds(folds_requested, Vec::new(), vec![note.into()])
    }

    pub fn from_folds(
        folds_requested: usize,
        folds: Vec<WalkForwardFold>,
        notes: Vec<String>,
    ) -> Self {
        let completed = folds.len();
        if completed == 0 {
            return Self {
                folds_requested,
                folds_completed: 0,
                pass_rate_pct: 0.0,
                average_score: 0.0,
                average_return: 0.0,
                average_sharpe: 0.0,
                worst_fold_return: None,
                folds,
                notes,
            };
        }

        let n = completed as f64;
        let passed = folds.iter().filter(|f| f.meets_min_trades).count();
        let average = |f: fn(&WalkForwardFold) -> f64| folds.iter().map(f).sum::<f64>() / n;
        let worst = folds
            .iter()
            .map(|f| f.test_metrics.total_return)
            .fold(f64::INFINITY, f64::min);

        Self {
            folds_requested,
            folds_completed: completed,
            pass_rate_pct: passed as f64 / n * 100.0,
            average_score: average(|f| f.test_score),
            average_return: average(|f| f.test_metrics.total_return),
            average_sharpe: average(|f| f.test_metrics.sharpe),
            worst_fold_return: Some(worst),
            folds,
            notes,
        }
    }
}

/// Final report of a parameter search
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyOptimizationResult {
    pub strategy_id: String,
    pub requested_iterations: usize,
    pub evaluated_iterations: usize,
    pub objective: String,
    pub recommended_parameters: StrategyParameters,
    pub recommended_symbols: Vec<String>,
    pub top_candidates: Vec<BacktestCandidate>,
    pub best_result: BacktestResult,
    pub score: f64,
    pub ensemble_mode: bool,
    pub ensemble_runs: usize,
    pub max_workers_used: usize,
    pub min_trades_target: usize,
    pub strict_min_trades: bool,
    pub best_candidate_meets_min_trades: bool,
    pub walk_forward: Option<WalkForwardReport>,
    pub notes: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, NaiveDate};

    fn fold(index: usize, total_return: f64, sharpe: f64, score: f64, meets: bool) -> WalkForwardFold {
        let base = NaiveDate::from_ymd_opt(2023, 1, 1).unwrap();
        let start = base + Duration::days(index as i64 * 100);
        WalkForwardFold {
            fold_index: index,
            train_range: DateRange::new(base, start - Duration::days(1)).unwrap(),
            test_range: DateRange::new(start, start + Duration::days(99)).unwrap(),
            test_score: score,
            test_metrics: CandidateMetrics {
                sharpe,
                total_return,
                max_drawdown: 5.0,
                win_rate: 50.0,
                total_trades: if meets { 10 } else { 0 },
            },
            meets_min_trades: meets,
        }
    }

    #[test]
    fn test_walk_forward_counts_failed_fold_as_completed() {
        let folds = vec![
            fold(1, 4.0, 1.0, 40.0, true),
            fold(2, 2.0, 0.5, 20.0, true),
            fold(3, -6.0, -1.0, -30.0, false),
            fold(4, 1.0, 0.2, 10.0, true),
        ];
        let report = WalkForwardReport::from_folds(4, folds, Vec::new());
        assert_eq!(report.folds_completed, 4);
        assert_eq!(report.pass_rate_pct, 75.0);
        assert_eq!(report.worst_fold_return, Some(-6.0));
        assert_eq!(report.average_return, 0.25);
        assert_eq!(report.average_score, 10.0);
    }

    #[test]
    fn test_walk_forward_worst_return_ignores_pass_flag() {
        let folds = vec![fold(1, -3.0, 0.1, 1.0, true), fold(2, 5.0, 0.1, 1.0, false)];
        let report = WalkForwardReport::from_folds(2, folds, Vec::new());
        assert_eq!(report.worst_fold_return, Some(-3.0));
        assert_eq!(report.pass_rate_pct, 50.0);
    }

    #[test]
    fn test_skipped_report_is_empty() {
        let report = WalkForwardReport::skipped(4, "insufficient history");
        assert_eq!(report.folds_completed, 0);
        assert_eq!(report.worst_fold_return, None);
        assert_eq!(report.notes, vec!["insufficient history".to_string()]);
    }
}
