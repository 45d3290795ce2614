use crate::domain::optimization::request::Objective;
use crate::domain::optimization::result::{BacktestCandidate, CandidateMetrics, EnsembleStats};
use crate::domain::performance::stats::Stats;

/// Score lost per missing trade below the target
const TRADE_SHORTFALL_PENALTY: f64 = 0.35;
/// Same penalty for ensemble medians
const ENSEMBLE_SHORTFALL_PENALTY: f64 = 0.9;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ObjectiveScore {
    pub score: f64,
    pub meets_min_trades: bool,
}

/// Rank one backtest by the chosen objective. Higher is better.
///
/// Candidates below `min_trades` keep a score (penalized per missing trade)
/// so lenient mode can still rank them; strict mode drops them at ranking time.
pub fn score_metrics(metrics: &CandidateMetrics, objective: Objective, min_trades: usize) -> ObjectiveScore {
    let sharpe = metrics.sharpe;
    let ret = metrics.total_return;
    let drawdown = metrics.max_drawdown.abs();
    let win = metrics.win_rate;

    let base = match objective {
        Objective::Balanced => sharpe * 80.0 + ret * 1.8 + win * 0.14 - drawdown * 0.9,
        Objective::Sharpe => sharpe * 110.0 + ret * 1.1 + win * 0.12 - drawdown * 1.0,
        Objective::Return => ret * 3.1 + sharpe * 30.0 + win * 0.08 - drawdown * 0.7,
    };
    let shortfall = min_trades.saturating_sub(metrics.total_trades) as f64;

    ObjectiveScore {
        score: base - shortfall * TRADE_SHORTFALL_PENALTY,
        meets_min_trades: metrics.total_trades >= min_trades,
    }
}

/// Robust score over the perturbed scenarios of one candidate.
///
/// Uses the median Sharpe and return, the 95th percentile drawdown and the
/// share of losing scenarios, so one lucky path cannot carry a candidate.
pub fn score_ensemble(
    scenarios: &[CandidateMetrics],
    objective: Objective,
    min_trades: usize,
) -> (ObjectiveScore, EnsembleStats) {
    let sharpes: Vec<f64> = scenarios.iter().map(|m| m.sharpe).collect();
    let returns: Vec<f64> = scenarios.iter().map(|m| m.total_return).collect();
    let drawdowns: Vec<f64> = scenarios.iter().map(|m| m.max_drawdown.abs()).collect();
    let trades: Vec<f64> = scenarios.iter().map(|m| m.total_trades as f64).collect();

    let median_sharpe = Stats::median(&sharpes);
    let median_return = Stats::median(&returns);
    let median_trades = Stats::median(&trades);
    let p95_drawdown = if scenarios.is_empty() {
        100.0
    } else {
        Stats::percentile(&drawdowns, 95)
    };
    let loss_probability = if scenarios.is_empty() {
        1.0
    } else {
        returns.iter().filter(|r| **r < 0.0).count() as f64 / scenarios.len() as f64
    };

    let base = match objective {
        Objective::Balanced => {
            median_sharpe * 90.0 + median_return * 1.7 - p95_drawdown * 1.2 - loss_probability * 38.0
        }
        Objective::Sharpe => {
            median_sharpe * 120.0 + median_return * 0.8 - p95_drawdown * 1.4 - loss_probability * 40.0
        }
        Objective::Return => {
            median_return * 3.0 + median_sharpe * 35.0 - p95_drawdown * 1.1 - loss_probability * 35.0
        }
    };
    let shortfall = (min_trades as f64 - median_trades).max(0.0);

    let score = ObjectiveScore {
        score: base - shortfall * ENSEMBLE_SHORTFALL_PENALTY,
        meets_min_trades: !scenarios.is_empty() && median_trades >= min_trades as f64,
    };
    let stats = EnsembleStats {
        runs: scenarios.len(),
        median_sharpe,
        median_return,
        p95_drawdown,
        loss_probability_pct: loss_probability * 100.0,
    };
    (score, stats)
}

/// Outcome of ranking a batch of candidates
#[derive(Debug, Clone)]
pub struct Ranking {
    pub ranked: Vec<BacktestCandidate>,
    /// Candidates dropped by the strict min-trades gate
    pub excluded: usize,
    /// Strict mode found nothing qualifying and fell back to the full field
    pub fell_back: bool,
}

/// Sort descending by score, ties broken by iteration order, and assign
/// 1-based ranks. In strict mode candidates below the trade target are
/// excluded unless nothing qualifies.
pub fn rank_candidates(mut candidates: Vec<BacktestCandidate>, strict_min_trades: bool) -> Ranking {
    let mut excluded = 0;
    let mut fell_back = false;

    if strict_min_trades {
        let qualifying = candidates.iter().filter(|c| c.meets_min_trades).count();
        if qualifying > 0 {
            excluded = candidates.len() - qualifying;
            candidates.retain(|c| c.meets_min_trades);
        } else if !candidates.is_empty() {
            fell_back = true;
        }
    }

    candidates.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.iteration.cmp(&b.iteration))
    });
    for (index, candidate) in candidates.iter_mut().enumerate() {
        candidate.rank = index + 1;
    }

    Ranking {
        ranked: candidates,
        excluded,
        fell_back,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::optimization::parameters::StrategyParameters;

    fn metrics(sharpe: f64, ret: f64, dd: f64, win: f64, trades: usize) -> CandidateMetrics {
        CandidateMetrics {
            sharpe,
            total_return: ret,
            max_drawdown: dd,
            win_rate: win,
            total_trades: trades,
        }
    }

    fn candidate(iteration: usize, score: f64, meets: bool) -> BacktestCandidate {
        BacktestCandidate {
            rank: 0,
            iteration,
            parameters: StrategyParameters::default(),
            symbol_subset: vec!["AAPL".to_string()],
            score,
            metrics: CandidateMetrics::default(),
            meets_min_trades: meets,
            ensemble: None,
        }
    }

    #[test]
    fn test_balanced_formula() {
        let m = metrics(1.0, 10.0, 5.0, 50.0, 12);
        let s = score_metrics(&m, Objective::Balanced, 10);
        assert!((s.score - (80.0 + 18.0 + 7.0 - 4.5)).abs() < 1e-9);
        assert!(s.meets_min_trades);
    }

    #[test]
    fn test_trade_shortfall_penalty() {
        let m = metrics(0.0, 0.0, 0.0, 0.0, 6);
        let s = score_metrics(&m, Objective::Return, 10);
        assert!((s.score + 4.0 * 0.35).abs() < 1e-9);
        assert!(!s.meets_min_trades);
    }

    #[test]
    fn test_objectives_weight_differently() {
        let m = metrics(0.5, 20.0, 8.0, 55.0, 20);
        let sharpe = score_metrics(&m, Objective::Sharpe, 0).score;
        let ret = score_metrics(&m, Objective::Return, 0).score;
        assert!((sharpe - (55.0 + 22.0 + 6.6 - 8.0)).abs() < 1e-9);
        assert!((ret - (62.0 + 15.0 + 4.4 - 5.6)).abs() < 1e-9);
    }

    #[test]
    fn test_ensemble_loss_probability() {
        let scenarios = vec![
            metrics(1.0, 5.0, 3.0, 50.0, 10),
            metrics(0.5, -2.0, 6.0, 40.0, 8),
            metrics(0.8, 3.0, 4.0, 45.0, 12),
            metrics(-0.2, -1.0, 9.0, 30.0, 9),
        ];
        let (score, stats) = score_ensemble(&scenarios, Objective::Balanced, 10);
        assert_eq!(stats.runs, 4);
        assert_eq!(stats.loss_probability_pct, 50.0);
        assert!(!score.meets_min_trades);
        assert!(score.score.is_finite());
    }

    #[test]
    fn test_strict_ranking_excludes_unqualified() {
        let ranking = rank_candidates(
            vec![candidate(0, 50.0, false), candidate(1, 10.0, true), candidate(2, 20.0, true)],
            true,
        );
        assert_eq!(ranking.excluded, 1);
        assert!(!ranking.fell_back);
        let order: Vec<usize> = ranking.ranked.iter().map(|c| c.iteration).collect();
        assert_eq!(order, vec![2, 1]);
        assert_eq!(ranking.ranked[0].rank, 1);
    }

    #[test]
    fn test_lenient_ranking_keeps_everything() {
        let ranking = rank_candidates(vec![candidate(0, 5.0, false), candidate(1, 7.0, true)], false);
        assert_eq!(ranking.ranked.len(), 2);
        assert_eq!(ranking.ranked[0].iteration, 1);
    }

    #[test]
    fn test_strict_ranking_falls_back_when_nothing_qualifies() {
        let ranking = rank_candidates(vec![candidate(0, 5.0, false), candidate(1, 5.0, false)], true);
        assert!(ranking.fell_back);
        assert_eq!(ranking.ranked[0].iteration, 0);
    }
}
