//! Randomized parameter search over the backtest simulator.
//!
//! Candidates are generated up front from a seeded generator so a run is
//! reproducible regardless of how many worker threads evaluate them. The
//! engine walks through these stages, each reported to the [`ProgressSink`]:
//!
//! 1. `initializing`: load bars once for the whole universe
//! 2. `parameter_search` / `ensemble_search`: score every candidate
//! 3. `symbol_trim`: try narrower universes for the winner
//! 4. `walk_forward`: out-of-sample folds for the winner
//! 5. `finalizing`

use crate::application::optimization::objective::{
    ObjectiveScore, rank_candidates, score_ensemble, score_metrics,
};
use crate::application::optimization::simulator::{
    BacktestRequest, BacktestSimulator, SimulationObserver,
};
use crate::application::optimization::walk_forward::run_walk_forward;
use crate::domain::backtest::{BacktestResult, CostModel, DateRange};
use crate::domain::errors::{OptimizationError, SimulationError};
use crate::domain::optimization::parameters::{ParameterSpace, StrategyParameters, normalize_symbols};
use crate::domain::optimization::request::OptimizationRequest;
use crate::domain::optimization::result::{
    BacktestCandidate, CandidateMetrics, StrategyOptimizationResult,
};
use crate::domain::performance::stats::Stats;
use crate::domain::ports::MarketDataProvider;
use anyhow::anyhow;
use chrono::Duration;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use rust_decimal::Decimal;
use rust_decimal::prelude::FromPrimitive;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::OwnedSemaphorePermit;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Calendar days of bars loaded ahead of the range to prime indicators
pub const WARMUP_DAYS: i64 = 120;
/// Universes at or below this size are never perturbed or trimmed
const MIN_UNIVERSE: usize = 8;
const BROAD_JUMP_PROBABILITY: f64 = 0.2;
const LOCAL_MOVE_FRACTION: f64 = 0.12;
const TRIM_FRACTIONS: [f64; 4] = [0.85, 0.70, 0.55, 0.40];

pub const STAGE_INITIALIZING: &str = "initializing";
pub const STAGE_PARAMETER_SEARCH: &str = "parameter_search";
pub const STAGE_ENSEMBLE_SEARCH: &str = "ensemble_search";
pub const STAGE_SYMBOL_TRIM: &str = "symbol_trim";
pub const STAGE_WALK_FORWARD: &str = "walk_forward";
pub const STAGE_FINALIZING: &str = "finalizing";

/// Receives progress from a running search.
///
/// Called from worker threads, so implementations must not block.
pub trait ProgressSink: Send + Sync {
    /// Iteration boundary
    fn report(&self, completed: usize, total: usize, stage: &str);

    /// Liveness signal from inside a long iteration. Implementations throttle it.
    fn pulse(&self) {}
}

pub struct NoopProgress;

impl ProgressSink for NoopProgress {
    fn report(&self, _completed: usize, _total: usize, _stage: &str) {}
}

/// Worker pool permits held for as long as the search itself runs
pub struct WorkerLease {
    _permits: Vec<OwnedSemaphorePermit>,
}

impl WorkerLease {
    pub fn new(permits: Vec<OwnedSemaphorePermit>) -> Self {
        Self { _permits: permits }
    }
}

/// Per-run execution context handed down by the caller
#[derive(Clone)]
pub struct SearchContext {
    pub cancel: CancellationToken,
    pub progress: Arc<dyn ProgressSink>,
    /// Worker threads granted for ensemble evaluation
    pub workers: usize,
    /// Released when the last clone of the context is dropped, which for
    /// the blocking search is when its thread returns
    lease: Option<Arc<WorkerLease>>,
}

impl SearchContext {
    pub fn new(cancel: CancellationToken, progress: Arc<dyn ProgressSink>, workers: usize) -> Self {
        Self {
            cancel,
            progress,
            workers: workers.max(1),
            lease: None,
        }
    }

    pub fn with_lease(mut self, lease: WorkerLease) -> Self {
        self.lease = Some(Arc::new(lease));
        self
    }

    /// Uncancellable context with no progress reporting
    pub fn detached(workers: usize) -> Self {
        Self::new(CancellationToken::new(), Arc::new(NoopProgress), workers)
    }
}

pub struct ParameterSearchEngine {
    market_data: Arc<dyn MarketDataProvider>,
}

impl ParameterSearchEngine {
    pub fn new(market_data: Arc<dyn MarketDataProvider>) -> Self {
        Self { market_data }
    }

    /// Run a full optimization for `strategy_id`.
    ///
    /// Bars are fetched once; all simulation runs on the blocking pool and
    /// checks `ctx.cancel` between sessions and between candidates.
    pub async fn optimize(
        &self,
        strategy_id: &str,
        request: &OptimizationRequest,
        ctx: SearchContext,
    ) -> Result<StrategyOptimizationResult, OptimizationError> {
        request.validate()?;
        let symbols = normalize_symbols(&request.symbols);
        ctx.progress.report(0, request.iterations, STAGE_INITIALIZING);

        info!(
            "ParameterSearch: {} iterations for {} over {} symbols ({})",
            request.iterations,
            strategy_id,
            symbols.len(),
            request.date_range
        );
        let simulator = BacktestSimulator::load(
            self.market_data.as_ref(),
            &symbols,
            &request.date_range,
            WARMUP_DAYS,
        )
        .await?;
        if ctx.cancel.is_cancelled() {
            return Err(OptimizationError::Canceled);
        }

        // The closure owns the context, so worker permits stay held until the
        // thread returns even if this future is aborted
        let strategy_id = strategy_id.to_string();
        let request = request.clone();
        tokio::task::spawn_blocking(move || {
            SearchRun::new(&simulator, &request, &ctx, symbols).execute(strategy_id)
        })
        .await
        .map_err(|e| OptimizationError::Internal(anyhow!("search worker failed: {}", e)))?
    }
}

/// Observer that pulses liveness and aborts the simulation on cancel
struct CancelAware<'a> {
    ctx: &'a SearchContext,
}

impl SimulationObserver for CancelAware<'_> {
    fn on_session(&self, _completed: usize, _total: usize) -> bool {
        self.ctx.progress.pulse();
        !self.ctx.cancel.is_cancelled()
    }
}

enum CandidateOutcome {
    Evaluated(BacktestCandidate),
    Skipped(SimulationError),
}

/// State of one search execution, shared read-only across worker threads
struct SearchRun<'a> {
    simulator: &'a BacktestSimulator,
    request: &'a OptimizationRequest,
    ctx: &'a SearchContext,
    space: ParameterSpace,
    symbols: Vec<String>,
    completed: AtomicUsize,
    total: usize,
}

impl<'a> SearchRun<'a> {
    fn new(
        simulator: &'a BacktestSimulator,
        request: &'a OptimizationRequest,
        ctx: &'a SearchContext,
        symbols: Vec<String>,
    ) -> Self {
        let trim_steps = if request.symbol_trim {
            trim_counts(symbols.len()).len()
        } else {
            0
        };
        let walk_steps = if request.walk_forward_enabled {
            request.walk_forward_folds.max(2)
        } else {
            0
        };
        Self {
            simulator,
            request,
            ctx,
            space: ParameterSpace::default().with_overrides(&request.parameter_bounds),
            symbols,
            completed: AtomicUsize::new(0),
            total: (request.iterations + trim_steps + walk_steps).max(1),
        }
    }

    fn step(&self, stage: &str) {
        let done = self.completed.fetch_add(1, Ordering::SeqCst) + 1;
        self.ctx.progress.report(done.min(self.total), self.total, stage);
    }

    fn check_cancel(&self) -> Result<(), OptimizationError> {
        if self.ctx.cancel.is_cancelled() {
            Err(OptimizationError::Canceled)
        } else {
            Ok(())
        }
    }

    fn execute(self, strategy_id: String) -> Result<StrategyOptimizationResult, OptimizationError> {
        let request = self.request;
        let seed = request.random_seed.unwrap_or(0);
        let base = self.space.normalize(&request.base_parameters);
        let candidates = build_candidates(
            &self.space,
            &base,
            &self.symbols,
            request.iterations,
            request.vary_symbols,
            &mut StdRng::seed_from_u64(seed),
        );

        let ensemble = request.ensemble_mode;
        let workers = if ensemble { self.ctx.workers } else { 1 };
        let outcomes = if ensemble {
            self.evaluate_parallel(&candidates, workers)?
        } else {
            let mut outcomes = Vec::with_capacity(candidates.len());
            for (iteration, (params, symbols)) in candidates.iter().enumerate() {
                self.check_cancel()?;
                debug!("ParameterSearch: Testing candidate {}/{}", iteration + 1, candidates.len());
                outcomes.push(self.evaluate_candidate(iteration, params, symbols)?);
                self.step(STAGE_PARAMETER_SEARCH);
            }
            outcomes
        };

        let mut notes = vec![
            format!(
                "Optimization objective: {} with drawdown penalties",
                request.objective.label()
            ),
            format!(
                "Minimum trades target: {} ({})",
                request.min_trades,
                if request.strict_min_trades { "strict gate" } else { "soft penalty" }
            ),
            if ensemble {
                format!(
                    "Evaluation mode: ensemble of {} scenarios per candidate on {} workers",
                    request.ensemble_runs, workers
                )
            } else {
                "Evaluation mode: single path".to_string()
            },
        ];

        let mut evaluated = Vec::with_capacity(outcomes.len());
        let mut first_skip: Option<SimulationError> = None;
        let mut skipped = 0;
        for outcome in outcomes {
            match outcome {
                CandidateOutcome::Evaluated(candidate) => evaluated.push(candidate),
                CandidateOutcome::Skipped(e) => {
                    skipped += 1;
                    first_skip.get_or_insert(e);
                }
            }
        }
        if evaluated.is_empty() {
            return Err(match first_skip {
                Some(e) => OptimizationError::Simulation(e),
                None => OptimizationError::Internal(anyhow!("no candidate produced a result")),
            });
        }
        if skipped > 0 {
            notes.push(format!("{} candidates could not be simulated and were skipped", skipped));
        }

        let evaluated_iterations = evaluated.len();
        let ranking = rank_candidates(evaluated, request.strict_min_trades);
        if ranking.fell_back {
            notes.push(format!(
                "No candidate met the strict min-trades target of {}; best available candidate was returned",
                request.min_trades
            ));
        } else if ranking.excluded > 0 {
            notes.push(format!(
                "{} candidates below {} trades were excluded from ranking",
                ranking.excluded, request.min_trades
            ));
        }

        let mut best = ranking.ranked[0].clone();
        let mut best_result = self.detail_run(&best.parameters, &best.symbol_subset)?;
        info!(
            "ParameterSearch: best candidate #{} score={:.3} trades={}",
            best.iteration, best.score, best.metrics.total_trades
        );

        if request.symbol_trim {
            if let Some((candidate, result)) = self.trim_universe(&best, &best_result)? {
                notes.push(format!(
                    "Symbol universe trimmed from {} to {} symbols",
                    best.symbol_subset.len(),
                    candidate.symbol_subset.len()
                ));
                best = candidate;
                best_result = result;
            }
        }

        let walk_forward = if request.walk_forward_enabled {
            self.check_cancel()?;
            let report = run_walk_forward(
                &request.date_range,
                request.walk_forward_folds,
                request.objective,
                request.min_trades,
                |window| {
                    self.check_cancel()?;
                    let result = self.backtest(
                        &best.parameters,
                        &best.symbol_subset,
                        window.test,
                        request.cost_model.clone(),
                    );
                    self.step(STAGE_WALK_FORWARD);
                    Ok(CandidateMetrics::from(&result?.metrics))
                },
            )?;
            Some(report)
        } else {
            None
        };

        if !best_result.diagnostics.symbols_without_data.is_empty() {
            notes.push(format!(
                "No data for: {}",
                best_result.diagnostics.symbols_without_data.join(", ")
            ));
        }
        if !best_result.diagnostics.insufficient_data.is_empty() {
            let short: Vec<&str> = best_result
                .diagnostics
                .insufficient_data
                .keys()
                .map(String::as_str)
                .collect();
            notes.push(format!("Insufficient history, excluded from entries: {}", short.join(", ")));
        }
        notes.push(if best.meets_min_trades {
            "Selected candidate met the trade-count target".to_string()
        } else {
            "Selected candidate is below the trade-count target".to_string()
        });

        self.completed.store(self.total, Ordering::SeqCst);
        self.ctx.progress.report(self.total, self.total, STAGE_FINALIZING);

        let mut top_candidates: Vec<BacktestCandidate> =
            ranking.ranked.into_iter().take(request.top_k.max(1)).collect();
        if let Some(first) = top_candidates.first_mut()
            && first.iteration == best.iteration
        {
            *first = BacktestCandidate { rank: 1, ..best.clone() };
        }

        Ok(StrategyOptimizationResult {
            strategy_id,
            requested_iterations: request.iterations,
            evaluated_iterations,
            objective: request.objective.label().to_string(),
            recommended_parameters: best.parameters.clone(),
            recommended_symbols: best.symbol_subset.clone(),
            top_candidates,
            best_result,
            score: best.score,
            ensemble_mode: ensemble,
            ensemble_runs: if ensemble { request.ensemble_runs } else { 1 },
            max_workers_used: workers,
            min_trades_target: request.min_trades,
            strict_min_trades: request.strict_min_trades,
            best_candidate_meets_min_trades: best.meets_min_trades,
            walk_forward,
            notes,
        })
    }

    /// Evaluate candidates on a dedicated pool sized to the granted workers.
    /// Output order follows candidate order, so results do not depend on
    /// thread scheduling.
    fn evaluate_parallel(
        &self,
        candidates: &[(StrategyParameters, Vec<String>)],
        workers: usize,
    ) -> Result<Vec<CandidateOutcome>, OptimizationError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("optimizer-{}", i))
            .build()
            .map_err(|e| OptimizationError::Internal(anyhow!("failed to build worker pool: {}", e)))?;

        pool.install(|| {
            candidates
                .par_iter()
                .enumerate()
                .map(|(iteration, (params, symbols))| -> Result<CandidateOutcome, OptimizationError> {
                    self.check_cancel()?;
                    let outcome = self.evaluate_candidate(iteration, params, symbols)?;
                    self.step(STAGE_ENSEMBLE_SEARCH);
                    Ok(outcome)
                })
                .collect()
        })
    }

    fn evaluate_candidate(
        &self,
        iteration: usize,
        params: &StrategyParameters,
        symbols: &[String],
    ) -> Result<CandidateOutcome, OptimizationError> {
        let request = self.request;
        let (metrics, scored, ensemble) = if request.ensemble_mode {
            let seed = request.random_seed.unwrap_or(0);
            let candidate_seed = seed
                .wrapping_add(iteration as u64 * 1009)
                .wrapping_add(17);
            let mut rng = StdRng::seed_from_u64(candidate_seed);

            let mut scenarios = Vec::with_capacity(request.ensemble_runs);
            let mut last_skip = None;
            for _ in 0..request.ensemble_runs {
                self.check_cancel()?;
                let scenario_symbols = perturb_symbols(symbols, &mut rng);
                let window = jitter_window(&request.date_range, &mut rng);
                let cost_model = jitter_costs(&request.cost_model, &mut rng);
                match self.backtest(params, &scenario_symbols, window, cost_model) {
                    Ok(result) => scenarios.push(CandidateMetrics::from(&result.metrics)),
                    Err(SimulationError::Canceled) => return Err(OptimizationError::Canceled),
                    Err(e) => last_skip = Some(e),
                }
            }
            if scenarios.is_empty() {
                return Ok(CandidateOutcome::Skipped(last_skip.unwrap_or(
                    SimulationError::InsufficientData {
                        symbols: symbols.to_vec(),
                    },
                )));
            }

            let (scored, stats) = score_ensemble(&scenarios, request.objective, request.min_trades);
            let trades: Vec<f64> = scenarios.iter().map(|m| m.total_trades as f64).collect();
            let wins: Vec<f64> = scenarios.iter().map(|m| m.win_rate).collect();
            let metrics = CandidateMetrics {
                sharpe: stats.median_sharpe,
                total_return: stats.median_return,
                max_drawdown: stats.p95_drawdown,
                win_rate: Stats::median(&wins),
                total_trades: Stats::median(&trades).round() as usize,
            };
            (metrics, scored, Some(stats))
        } else {
            match self.backtest(params, symbols, request.date_range, request.cost_model.clone()) {
                Ok(result) => {
                    let metrics = CandidateMetrics::from(&result.metrics);
                    let scored = score_metrics(&metrics, request.objective, request.min_trades);
                    (metrics, scored, None)
                }
                Err(SimulationError::Canceled) => return Err(OptimizationError::Canceled),
                Err(e) => {
                    debug!("ParameterSearch: candidate {} skipped: {}", iteration, e);
                    return Ok(CandidateOutcome::Skipped(e));
                }
            }
        };

        let ObjectiveScore {
            score,
            meets_min_trades,
        } = scored;
        Ok(CandidateOutcome::Evaluated(BacktestCandidate {
            rank: 0,
            iteration,
            parameters: params.clone(),
            symbol_subset: symbols.to_vec(),
            score,
            metrics,
            meets_min_trades,
            ensemble,
        }))
    }

    /// Re-evaluate the winner on progressively narrower universes ranked by
    /// per-symbol P&L. A narrower universe is adopted only if it scores higher.
    fn trim_universe(
        &self,
        best: &BacktestCandidate,
        best_result: &BacktestResult,
    ) -> Result<Option<(BacktestCandidate, BacktestResult)>, OptimizationError> {
        let universe = &best.symbol_subset;
        let mut ranked = universe.clone();
        ranked.sort_by(|a, b| {
            best_result
                .symbol_pnl
                .get(b)
                .cmp(&best_result.symbol_pnl.get(a))
        });

        let mut winner: Option<BacktestCandidate> = None;
        for count in trim_counts(universe.len()) {
            self.check_cancel()?;
            let keep = &ranked[..count];
            let subset: Vec<String> = universe.iter().filter(|s| keep.contains(s)).cloned().collect();
            let outcome = self.evaluate_candidate(best.iteration, &best.parameters, &subset)?;
            self.step(STAGE_SYMBOL_TRIM);

            let CandidateOutcome::Evaluated(candidate) = outcome else {
                continue;
            };
            let current = winner.as_ref().map_or(best.score, |w| w.score);
            debug!(
                "ParameterSearch: trim to {} symbols scored {:.3} (current {:.3})",
                count, candidate.score, current
            );
            if candidate.score > current {
                winner = Some(candidate);
            }
        }

        match winner {
            Some(candidate) => {
                let result = self.detail_run(&candidate.parameters, &candidate.symbol_subset)?;
                Ok(Some((candidate, result)))
            }
            None => Ok(None),
        }
    }

    /// Full-window run with the request's own cost model
    fn detail_run(
        &self,
        params: &StrategyParameters,
        symbols: &[String],
    ) -> Result<BacktestResult, OptimizationError> {
        self.check_cancel()?;
        Ok(self.backtest(
            params,
            symbols,
            self.request.date_range,
            self.request.cost_model.clone(),
        )?)
    }

    fn backtest(
        &self,
        params: &StrategyParameters,
        symbols: &[String],
        date_range: DateRange,
        cost_model: CostModel,
    ) -> Result<BacktestResult, SimulationError> {
        let request = BacktestRequest {
            parameters: params.clone(),
            symbols: symbols.to_vec(),
            date_range,
            capital: self.request.capital.clone(),
            cost_model,
        };
        self.simulator
            .run_observed(&request, &CancelAware { ctx: self.ctx })
    }
}

/// Candidate 0 is the base vector on the full universe; the rest are seeded
/// mutations of it.
fn build_candidates(
    space: &ParameterSpace,
    base: &StrategyParameters,
    symbols: &[String],
    iterations: usize,
    vary_symbols: bool,
    rng: &mut StdRng,
) -> Vec<(StrategyParameters, Vec<String>)> {
    let mut candidates = Vec::with_capacity(iterations);
    candidates.push((base.clone(), symbols.to_vec()));
    while candidates.len() < iterations {
        let params = mutate(space, base, rng);
        let subset = if vary_symbols {
            perturb_symbols(symbols, rng)
        } else {
            symbols.to_vec()
        };
        candidates.push((params, subset));
    }
    candidates
}

/// Mostly local moves around the base with occasional jumps across the range
fn mutate(space: &ParameterSpace, base: &StrategyParameters, rng: &mut StdRng) -> StrategyParameters {
    let mut candidate = base.clone();
    for bound in space.bounds() {
        let span = bound.span();
        if span <= 0.0 {
            continue;
        }
        let raw = if rng.random::<f64>() < BROAD_JUMP_PROBABILITY {
            rng.random_range(bound.min..=bound.max)
        } else {
            let offset = rng.random_range(-LOCAL_MOVE_FRACTION..=LOCAL_MOVE_FRACTION) * span;
            base.value_or(&bound.name, bound.default) + offset
        };
        candidate.set(bound.name.clone(), raw);
    }
    space.normalize(&candidate)
}

/// Keep a random 70-100% of a large universe, never fewer than 8 symbols.
/// Universe order is preserved.
fn perturb_symbols(symbols: &[String], rng: &mut StdRng) -> Vec<String> {
    if symbols.len() <= MIN_UNIVERSE {
        return symbols.to_vec();
    }
    let ratio = rng.random_range(0.7..=1.0);
    let keep = ((symbols.len() as f64 * ratio).round() as usize).clamp(MIN_UNIVERSE, symbols.len());
    if keep >= symbols.len() {
        return symbols.to_vec();
    }
    let mut picked = rand::seq::index::sample(rng, symbols.len(), keep).into_vec();
    picked.sort_unstable();
    picked.into_iter().map(|i| symbols[i].clone()).collect()
}

/// Shift both ends by up to 3 days on long ranges
fn jitter_window(range: &DateRange, rng: &mut StdRng) -> DateRange {
    let span = range.days();
    let jitter = (span / 120).min(3);
    if jitter <= 0 {
        return *range;
    }
    let start = range.start + Duration::days(rng.random_range(-jitter..=jitter));
    let mut end = range.end + Duration::days(rng.random_range(-jitter..=jitter));
    if end <= start {
        end = start + Duration::days((span / 2).max(30));
    }
    DateRange { start, end }
}

/// Perturb fees and slippage around the request's cost model
fn jitter_costs(base: &CostModel, rng: &mut StdRng) -> CostModel {
    let decimal = |v: f64| Decimal::from_f64(v).unwrap_or(Decimal::ZERO).round_dp(4);
    let fee = (decimal(rng.random_range(-1.5..=4.0)) + base.fee_bps).max(Decimal::ZERO);
    let slippage = (decimal(rng.random_range(-2.0..=12.0)) + base.slippage_bps)
        .clamp(Decimal::ONE, Decimal::from(75));
    CostModel {
        fee_bps: fee,
        slippage_bps: slippage,
        slippage_jitter_bps: base.slippage_jitter_bps,
        max_position_size: base.max_position_size,
        seed: rng.random(),
    }
}

/// Universe sizes for the trim stage, largest first, each strictly smaller
/// than the universe and at least 8
fn trim_counts(total: usize) -> Vec<usize> {
    if total <= MIN_UNIVERSE {
        return Vec::new();
    }
    let mut counts: Vec<usize> = TRIM_FRACTIONS
        .iter()
        .map(|f| ((total as f64 * f) as usize).max(MIN_UNIVERSE))
        .filter(|c| *c < total)
        .collect();
    counts.dedup();
    counts
}
