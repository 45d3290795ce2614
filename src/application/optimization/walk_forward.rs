use crate::application::optimization::objective::score_metrics;
use crate::domain::backtest::DateRange;
use crate::domain::errors::OptimizationError;
use crate::domain::optimization::request::Objective;
use crate::domain::optimization::result::{CandidateMetrics, WalkForwardFold, WalkForwardReport};
use chrono::Duration;
use tracing::{info, warn};

/// Shortest range worth splitting into folds
pub const MIN_WALK_FORWARD_DAYS: i64 = 120;
const MIN_TEST_SPAN_DAYS: i64 = 30;
const MIN_TEST_WINDOW_DAYS: i64 = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FoldWindow {
    pub fold_index: usize,
    pub train: DateRange,
    pub test: DateRange,
}

/// Split `range` into expanding train windows, each followed by a
/// non-overlapping test window of fixed span.
///
/// Returns `Err(note)` when the range is too short to split at all.
pub fn plan_folds(range: &DateRange, requested: usize) -> Result<Vec<FoldWindow>, String> {
    let folds = requested.max(2);
    let total_days = range.days();
    if total_days < MIN_WALK_FORWARD_DAYS {
        return Err(format!(
            "Walk-forward skipped: {} days of history, need at least {}",
            total_days, MIN_WALK_FORWARD_DAYS
        ));
    }

    let span = (total_days / (folds as i64 + 1)).max(MIN_TEST_SPAN_DAYS);
    let mut windows = Vec::with_capacity(folds);
    for idx in 1..=folds {
        let train_end = range.start + Duration::days(idx as i64 * span - 1);
        let test_start = train_end + Duration::days(1);
        if train_end <= range.start || test_start > range.end {
            break;
        }
        let test_end = (test_start + Duration::days(span - 1)).min(range.end);
        if (test_end - test_start).num_days() + 1 < MIN_TEST_WINDOW_DAYS {
            break;
        }
        windows.push(FoldWindow {
            fold_index: idx,
            train: DateRange {
                start: range.start,
                end: train_end,
            },
            test: DateRange {
                start: test_start,
                end: test_end,
            },
        });
    }
    Ok(windows)
}

/// Score the same parameters out-of-sample on every planned test window.
///
/// `evaluate` runs one backtest over a test window. A fold that cannot be
/// simulated ends the walk with a note; cancellation propagates.
pub fn run_walk_forward<F>(
    range: &DateRange,
    requested: usize,
    objective: Objective,
    min_trades: usize,
    mut evaluate: F,
) -> Result<WalkForwardReport, OptimizationError>
where
    F: FnMut(&FoldWindow) -> Result<CandidateMetrics, OptimizationError>,
{
    let folds_requested = requested.max(2);
    let windows = match plan_folds(range, requested) {
        Ok(windows) => windows,
        Err(note) => {
            info!("WalkForward: {}", note);
            return Ok(WalkForwardReport::skipped(folds_requested, note));
        }
    };

    let mut folds = Vec::with_capacity(windows.len());
    let mut notes = vec![
        "Expanding train windows with sequential out-of-sample test windows".to_string(),
    ];
    for window in &windows {
        let metrics = match evaluate(window) {
            Ok(metrics) => metrics,
            Err(e) if e.is_canceled() => return Err(e),
            Err(e) => {
                warn!("WalkForward: fold {} failed: {}", window.fold_index, e);
                notes.push(format!("Fold {} could not be evaluated: {}", window.fold_index, e));
                break;
            }
        };
        let scored = score_metrics(&metrics, objective, min_trades);
        info!(
            "WalkForward: fold {} test {} score={:.3} return={:.2}% trades={}",
            window.fold_index, window.test, scored.score, metrics.total_return, metrics.total_trades
        );
        folds.push(WalkForwardFold {
            fold_index: window.fold_index,
            train_range: window.train,
            test_range: window.test,
            test_score: scored.score,
            test_metrics: metrics,
            meets_min_trades: scored.meets_min_trades,
        });
    }

    if folds.is_empty() {
        notes.push("Walk-forward completed with zero folds; widen the range or reduce folds".to_string());
    }
    Ok(WalkForwardReport::from_folds(folds_requested, folds, notes))
}
