use crate::domain::backtest::{
    BacktestDiagnostics, BacktestParameters, BacktestResult, CapitalSchedule,
    ContributionFrequency, CostModel, DateRange, EquityPoint, ExitReason, SimulatedTrade,
};
use crate::domain::errors::SimulationError;
use crate::domain::optimization::parameters::StrategyParameters;
use crate::domain::performance::metrics::BacktestMetrics;
use crate::domain::performance::stats::Stats;
use crate::domain::ports::MarketDataProvider;
use crate::domain::trading::fee_model::{BasisPointFeeModel, FeeModel};
use crate::domain::trading::types::{Candle, OrderSide};
use crate::infrastructure::simulation::slippage_model::{SeededSlippage, SlippageModel};
use anyhow::{Context, Result};
use chrono::{Datelike, Duration, NaiveDate};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info};

/// Sessions entries stay paused after the consecutive-loss breaker trips
const LOSS_PAUSE_SESSIONS: usize = 5;
/// Smallest tranche worth placing
const MIN_TRADE_NOTIONAL: Decimal = dec!(1);

/// Everything one simulated run needs besides the bars
#[derive(Debug, Clone)]
pub struct BacktestRequest {
    pub parameters: StrategyParameters,
    pub symbols: Vec<String>,
    pub date_range: DateRange,
    pub capital: CapitalSchedule,
    pub cost_model: CostModel,
}

/// Per-session callback. Returning false aborts the run with `Canceled`.
pub trait SimulationObserver: Sync {
    fn on_session(&self, completed: usize, total: usize) -> bool;
}

pub struct NoopObserver;

impl SimulationObserver for NoopObserver {
    fn on_session(&self, _completed: usize, _total: usize) -> bool {
        true
    }
}

/// Daily bars for one symbol plus the derived lookup tables
#[derive(Debug)]
struct SymbolSeries {
    bars: Vec<Candle>,
    closes: Vec<f64>,
    index_by_date: BTreeMap<NaiveDate, usize>,
}

impl SymbolSeries {
    fn new(mut bars: Vec<Candle>) -> Self {
        bars.sort_by_key(|b| b.timestamp);
        // one bar per session, keep the last one seen
        let mut by_date: BTreeMap<NaiveDate, Candle> = BTreeMap::new();
        for bar in bars {
            by_date.insert(bar.session_date(), bar);
        }
        let bars: Vec<Candle> = by_date.into_values().collect();
        let closes = bars.iter().map(|b| b.close.to_f64().unwrap_or(0.0)).collect();
        let index_by_date = bars
            .iter()
            .enumerate()
            .map(|(i, b)| (b.session_date(), i))
            .collect();
        Self {
            bars,
            closes,
            index_by_date,
        }
    }

    fn bars_through(&self, end: NaiveDate) -> usize {
        self.index_by_date.range(..=end).count()
    }

    fn bars_within(&self, range: &DateRange) -> usize {
        self.index_by_date.range(range.start..=range.end).count()
    }

    fn last_close_on_or_before(&self, date: NaiveDate) -> Option<Decimal> {
        self.index_by_date
            .range(..=date)
            .next_back()
            .map(|(_, &i)| self.bars[i].close)
    }
}

/// Immutable, shareable bar store for repeated simulations
pub type BarSet = BTreeMap<String, Vec<Candle>>;

/// Open simulated position
#[derive(Debug, Clone)]
struct OpenPosition {
    entry_date: NaiveDate,
    quantity: Decimal,
    cost_basis: Decimal,
    entry_fees: Decimal,
    tranches: u32,
    last_fill_price: Decimal,
    tranche_notional: Decimal,
    high_water: Decimal,
    stop_distance: Decimal,
}

impl OpenPosition {
    fn avg_entry_price(&self) -> Decimal {
        if self.quantity.is_zero() {
            Decimal::ZERO
        } else {
            self.cost_basis / self.quantity
        }
    }
}

/// Mutable account state of one run
struct Account<'a> {
    params: &'a BacktestParameters,
    cash: Decimal,
    contributed: Decimal,
    positions: BTreeMap<String, OpenPosition>,
    trades: Vec<SimulatedTrade>,
    diagnostics: BacktestDiagnostics,
    slippage: SeededSlippage,
    fees: BasisPointFeeModel,
    max_position: Option<Decimal>,
    consecutive_losses: u32,
    paused_until: Option<usize>,
    drawdown_halted: bool,
    peak_nav: f64,
}

impl Account<'_> {
    fn close_position(
        &mut self,
        symbol: &str,
        date: NaiveDate,
        reference_price: Decimal,
        reason: ExitReason,
        session: usize,
    ) {
        let Some(position) = self.positions.remove(symbol) else {
            return;
        };
        let fill = self
            .slippage
            .calculate_execution_price(reference_price, OrderSide::Sell);
        let exit_fee = self
            .fees
            .calculate_cost(position.quantity, fill, OrderSide::Sell)
            .fee;
        let proceeds = position.quantity * fill;
        self.cash += proceeds - exit_fee;

        let pnl = (proceeds - exit_fee - position.cost_basis - position.entry_fees).round_dp(6);
        let invested = position.cost_basis + position.entry_fees;
        let return_pct = if invested > Decimal::ZERO {
            (pnl / invested * dec!(100)).to_f64().unwrap_or(0.0)
        } else {
            0.0
        };

        self.trades.push(SimulatedTrade {
            symbol: symbol.to_string(),
            entry_date: position.entry_date,
            exit_date: date,
            entry_price: position.avg_entry_price().round_dp(6),
            exit_price: fill,
            quantity: position.quantity,
            pnl,
            return_pct,
            fees: (position.entry_fees + exit_fee).round_dp(6),
            hold_days: (date - position.entry_date).num_days(),
            tranches: position.tranches,
            exit_reason: reason,
        });

        if pnl > Decimal::ZERO {
            self.consecutive_losses = 0;
        } else {
            self.consecutive_losses += 1;
            if self.consecutive_losses >= self.params.max_consecutive_losses {
                self.paused_until = Some(session + LOSS_PAUSE_SESSIONS);
                self.consecutive_losses = 0;
            }
        }
    }

    /// Buy one tranche worth at most `notional`. Returns (fill, quantity, fee).
    fn buy(&mut self, notional: Decimal, close: Decimal) -> Option<(Decimal, Decimal, Decimal)> {
        let fill = self.slippage.calculate_execution_price(close, OrderSide::Buy);
        if fill <= Decimal::ZERO {
            return None;
        }
        let fee_rate = self.fees.fee_bps / dec!(10000);
        let affordable = notional.min(self.cash);
        let quantity = (affordable / (fill * (Decimal::ONE + fee_rate)))
            .round_dp_with_strategy(6, RoundingStrategy::ToZero);
        if quantity <= Decimal::ZERO {
            return None;
        }
        let fee = self.fees.calculate_cost(quantity, fill, OrderSide::Buy).fee;
        let cost = quantity * fill;
        if cost + fee > self.cash {
            return None;
        }
        self.cash -= cost + fee;
        Some((fill, quantity, fee))
    }
}

/// Deterministic bar-by-bar trade simulation over daily sessions
#[derive(Clone)]
pub struct BacktestSimulator {
    series: Arc<BTreeMap<String, SymbolSeries>>,
}

impl BacktestSimulator {
    pub fn new(bars: BarSet) -> Self {
        let series = bars
            .into_iter()
            .map(|(symbol, bars)| (symbol, SymbolSeries::new(bars)))
            .collect();
        Self {
            series: Arc::new(series),
        }
    }

    /// Fetch daily bars for `symbols`, starting `warmup_days` before the range
    /// so indicators are primed on the first session.
    pub async fn load(
        provider: &dyn MarketDataProvider,
        symbols: &[String],
        range: &DateRange,
        warmup_days: i64,
    ) -> Result<Self> {
        let fetch_start = range.start - Duration::days(warmup_days.max(0));
        let mut bars = BarSet::new();
        for symbol in symbols {
            let series = provider
                .historical_bars(symbol, fetch_start, range.end)
                .await
                .with_context(|| format!("Failed to fetch historical bars for {}", symbol))?;
            debug!("BacktestSimulator: loaded {} bars for {}", series.len(), symbol);
            bars.insert(symbol.clone(), series);
        }
        info!(
            "BacktestSimulator: loaded bars for {} symbols ({} warm-up days)",
            bars.len(),
            warmup_days
        );
        Ok(Self::new(bars))
    }

    pub fn symbols(&self) -> Vec<String> {
        self.series.keys().cloned().collect()
    }

    /// Session dates covered by the stored bars inside `range`
    pub fn sessions_in(&self, symbols: &[String], range: &DateRange) -> Vec<NaiveDate> {
        let mut sessions = BTreeSet::new();
        for symbol in symbols {
            if let Some(series) = self.series.get(symbol) {
                sessions.extend(series.index_by_date.range(range.start..=range.end).map(|(d, _)| *d));
            }
        }
        sessions.into_iter().collect()
    }

    pub fn run(&self, request: &BacktestRequest) -> Result<BacktestResult, SimulationError> {
        self.run_observed(request, &NoopObserver)
    }

    pub fn run_observed(
        &self,
        request: &BacktestRequest,
        observer: &dyn SimulationObserver,
    ) -> Result<BacktestResult, SimulationError> {
        let params = BacktestParameters::from_parameters(&request.parameters)?;
        let range = request.date_range;
        if request.capital.initial_capital <= Decimal::ZERO {
            return Err(SimulationError::InvalidParameters {
                reason: "initial capital must be positive".to_string(),
            });
        }

        let mut symbols: Vec<String> = request.symbols.clone();
        symbols.sort();
        symbols.dedup();

        let mut diagnostics = BacktestDiagnostics::default();
        let mut eligible: Vec<String> = Vec::new();
        for symbol in &symbols {
            let Some(series) = self.series.get(symbol) else {
                diagnostics.symbols_without_data.push(symbol.clone());
                continue;
            };
            if series.bars_within(&range) == 0 {
                diagnostics.symbols_without_data.push(symbol.clone());
                continue;
            }
            let available = series.bars_through(range.end);
            if available < params.lookback_period + 1 {
                diagnostics.insufficient_data.insert(symbol.clone(), available);
                continue;
            }
            eligible.push(symbol.clone());
        }

        if eligible.is_empty() {
            return Err(SimulationError::InsufficientData { symbols });
        }

        let sessions = self.sessions_in(&eligible, &range);
        diagnostics.sessions = sessions.len();

        let mut account = Account {
            params: &params,
            cash: request.capital.initial_capital,
            contributed: request.capital.initial_capital,
            positions: BTreeMap::new(),
            trades: Vec::new(),
            diagnostics,
            slippage: SeededSlippage::new(
                request.cost_model.slippage_bps,
                request.cost_model.slippage_jitter_bps,
                request.cost_model.seed,
            ),
            fees: BasisPointFeeModel::new(request.cost_model.fee_bps),
            max_position: request.cost_model.max_position_size,
            consecutive_losses: 0,
            paused_until: None,
            drawdown_halted: false,
            peak_nav: 1.0,
        };

        let mut equity_curve: Vec<EquityPoint> = Vec::with_capacity(sessions.len());
        let mut previous_session: Option<NaiveDate> = None;
        let last_index = sessions.len().saturating_sub(1);

        for (session_idx, &date) in sessions.iter().enumerate() {
            if let Some(prev) = previous_session
                && Self::contribution_due(&request.capital, prev, date)
            {
                account.cash += request.capital.contribution_amount;
                account.contributed += request.capital.contribution_amount;
                account.diagnostics.contributions_made += 1;
            }

            let exited_today = self.evaluate_exits(&mut account, date, session_idx);
            self.update_high_water(&mut account, date);

            if session_idx == last_index {
                let open: Vec<String> = account.positions.keys().cloned().collect();
                for symbol in open {
                    if let Some(close) = self.series[&symbol].last_close_on_or_before(date) {
                        account.close_position(
                            &symbol,
                            date,
                            close,
                            ExitReason::EndOfBacktest,
                            session_idx,
                        );
                    }
                }
            } else {
                self.evaluate_tranche_adds(&mut account, date, session_idx);
                self.evaluate_entries(&mut account, &eligible, &exited_today, date, session_idx);
            }

            let positions_value: Decimal = account
                .positions
                .iter()
                .filter_map(|(symbol, p)| {
                    self.series[symbol]
                        .last_close_on_or_before(date)
                        .map(|close| p.quantity * close)
                })
                .sum();
            equity_curve.push(EquityPoint {
                date,
                equity: (account.cash + positions_value).round_dp(6),
                cash: account.cash.round_dp(6),
                positions_value: positions_value.round_dp(6),
                contributed: account.contributed,
            });

            previous_session = Some(date);
            if !observer.on_session(session_idx + 1, sessions.len()) {
                return Err(SimulationError::Canceled);
            }
        }

        let mut symbol_pnl: BTreeMap<String, Decimal> = BTreeMap::new();
        for trade in &account.trades {
            *symbol_pnl.entry(trade.symbol.clone()).or_insert(Decimal::ZERO) += trade.pnl;
        }

        let metrics = BacktestMetrics::calculate(&account.trades, &equity_curve);
        let final_capital = equity_curve
            .last()
            .map(|p| p.equity)
            .unwrap_or(request.capital.initial_capital);

        Ok(BacktestResult {
            symbols,
            date_range: range,
            initial_capital: request.capital.initial_capital,
            total_contributed: account.contributed,
            final_capital,
            total_return: metrics.total_return_pct,
            trades: account.trades,
            equity_curve,
            metrics,
            diagnostics: account.diagnostics,
            symbol_pnl,
        })
    }

    fn contribution_due(schedule: &CapitalSchedule, prev: NaiveDate, date: NaiveDate) -> bool {
        if schedule.contribution_amount <= Decimal::ZERO {
            return false;
        }
        match schedule.contribution_frequency {
            ContributionFrequency::None => false,
            ContributionFrequency::Weekly => prev.iso_week() != date.iso_week(),
            ContributionFrequency::Monthly => {
                (prev.year(), prev.month()) != (date.year(), date.month())
            }
        }
    }

    /// Stop, trailing stop, target and time exits. Returns symbols closed today.
    fn evaluate_exits(
        &self,
        account: &mut Account<'_>,
        date: NaiveDate,
        session_idx: usize,
    ) -> BTreeSet<String> {
        let mut exited = BTreeSet::new();
        let open: Vec<String> = account.positions.keys().cloned().collect();
        let params = account.params;

        for symbol in open {
            let series = &self.series[&symbol];
            let Some(&bar_idx) = series.index_by_date.get(&date) else {
                continue;
            };
            let bar = &series.bars[bar_idx];
            let Some(position) = account.positions.get(&symbol) else {
                continue;
            };

            let avg_entry = position.avg_entry_price();
            let stop_price = avg_entry - position.stop_distance;
            let trail_price =
                position.high_water * (Decimal::ONE - params.trailing_stop_pct / dec!(100));
            let target_price = avg_entry * (Decimal::ONE + params.take_profit_pct / dec!(100));
            let protective = stop_price.max(trail_price);
            let days_held = (date - position.entry_date).num_days();

            let exit = if bar.low <= protective {
                let reason = if trail_price > stop_price {
                    ExitReason::TrailingStop
                } else {
                    ExitReason::StopLoss
                };
                // a gap through the level fills at the open
                Some((reason, bar.open.min(protective)))
            } else if bar.high >= target_price {
                Some((ExitReason::TakeProfit, bar.open.max(target_price)))
            } else if days_held >= params.max_hold_days {
                Some((ExitReason::TimeExit, bar.close))
            } else {
                None
            };

            if let Some((reason, price)) = exit {
                account.close_position(&symbol, date, price, reason, session_idx);
                exited.insert(symbol);
            }
        }
        exited
    }

    fn update_high_water(&self, account: &mut Account<'_>, date: NaiveDate) {
        for (symbol, position) in account.positions.iter_mut() {
            let series = &self.series[symbol];
            if let Some(&i) = series.index_by_date.get(&date) {
                position.high_water = position.high_water.max(series.bars[i].high);
            }
        }
    }

    fn entries_blocked(&self, account: &Account<'_>, session_idx: usize) -> Option<&'static str> {
        if account.drawdown_halted {
            return Some("max_drawdown_halt");
        }
        if account.paused_until.is_some_and(|until| session_idx < until) {
            return Some("consecutive_loss_pause");
        }
        None
    }

    /// Averaging-down tranches for positions that dipped further
    fn evaluate_tranche_adds(&self, account: &mut Account<'_>, date: NaiveDate, session_idx: usize) {
        let params = account.params;
        if params.dca_tranches <= 1 {
            return;
        }
        let candidates: Vec<String> = account
            .positions
            .iter()
            .filter(|(_, p)| p.tranches < params.dca_tranches)
            .map(|(s, _)| s.clone())
            .collect();

        for symbol in candidates {
            let series = &self.series[&symbol];
            let Some(&i) = series.index_by_date.get(&date) else {
                continue;
            };
            let close = series.bars[i].close;
            let Some(position) = account.positions.get(&symbol) else {
                continue;
            };
            let trigger =
                position.last_fill_price * (Decimal::ONE - params.dip_buy_threshold_pct / dec!(100));
            if close > trigger {
                continue;
            }
            if let Some(reason) = self.entries_blocked(account, session_idx) {
                account.diagnostics.block(reason);
                continue;
            }
            let notional = position.tranche_notional;
            if account.cash < MIN_TRADE_NOTIONAL {
                account.diagnostics.block("insufficient_cash");
                continue;
            }
            match account.buy(notional, close) {
                Some((fill, quantity, fee)) => {
                    if let Some(position) = account.positions.get_mut(&symbol) {
                        position.quantity += quantity;
                        position.cost_basis += quantity * fill;
                        position.entry_fees += fee;
                        position.tranches += 1;
                        position.last_fill_price = fill;
                    }
                }
                None => account.diagnostics.block("insufficient_cash"),
            }
        }
    }

    fn evaluate_entries(
        &self,
        account: &mut Account<'_>,
        eligible: &[String],
        exited_today: &BTreeSet<String>,
        date: NaiveDate,
        session_idx: usize,
    ) {
        let params = account.params;
        let equity = self.mark_to_market(account, date);
        let nav = (equity / account.contributed).to_f64().unwrap_or(1.0);
        account.peak_nav = account.peak_nav.max(nav);
        let drawdown_pct = (account.peak_nav - nav) / account.peak_nav * 100.0;
        if drawdown_pct > params.max_drawdown_pct.to_f64().unwrap_or(100.0) {
            account.drawdown_halted = true;
        }

        for symbol in eligible {
            if account.positions.contains_key(symbol) || exited_today.contains(symbol) {
                continue;
            }
            let series = &self.series[symbol];
            let Some(&i) = series.index_by_date.get(&date) else {
                continue;
            };
            if i + 1 < params.lookback_period {
                continue;
            }
            let window = &series.closes[i + 1 - params.lookback_period..=i];
            let close = series.closes[i];
            let sma = Stats::mean(window);
            let dip_level = sma * (1.0 - params.dip_buy_threshold_pct.to_f64().unwrap_or(0.0) / 100.0);
            let below_sma = sma > 0.0 && close <= dip_level;
            let stretched = Stats::zscore(window).is_some_and(|z| z <= params.zscore_entry_threshold);
            if !(below_sma || stretched) {
                continue;
            }

            if let Some(reason) = self.entries_blocked(account, session_idx) {
                account.diagnostics.block(reason);
                continue;
            }

            let bar = &series.bars[i];
            let stop_pct_distance = bar.close * params.stop_loss_pct / dec!(100);
            let atr = Self::average_range(&series.bars[i + 1 - params.lookback_period..=i]);
            let stop_distance = stop_pct_distance.max(atr * params.atr_stop_mult);

            let risk_budget = equity * params.risk_per_trade_pct / params.stop_loss_pct;
            let mut budget = params.position_size.min(risk_budget);
            if let Some(cap) = account.max_position {
                budget = budget.min(cap);
            }
            let tranche_notional = (budget / Decimal::from(params.dca_tranches)).round_dp(6);

            if tranche_notional < MIN_TRADE_NOTIONAL || account.cash < MIN_TRADE_NOTIONAL {
                account.diagnostics.block("insufficient_cash");
                continue;
            }

            match account.buy(tranche_notional, bar.close) {
                Some((fill, quantity, fee)) => {
                    account.positions.insert(
                        symbol.clone(),
                        OpenPosition {
                            entry_date: date,
                            quantity,
                            cost_basis: quantity * fill,
                            entry_fees: fee,
                            tranches: 1,
                            last_fill_price: fill,
                            tranche_notional,
                            high_water: fill,
                            stop_distance,
                        },
                    );
                }
                None => account.diagnostics.block("insufficient_cash"),
            }
        }
    }

    fn mark_to_market(&self, account: &Account<'_>, date: NaiveDate) -> Decimal {
        let positions_value: Decimal = account
            .positions
            .iter()
            .filter_map(|(symbol, p)| {
                self.series[symbol]
                    .last_close_on_or_before(date)
                    .map(|close| p.quantity * close)
            })
            .sum();
        account.cash + positions_value
    }

    /// Mean high-low range across the window
    fn average_range(bars: &[Candle]) -> Decimal {
        if bars.is_empty() {
            return Decimal::ZERO;
        }
        let total: Decimal = bars.iter().map(|b| b.high - b.low).sum();
        (total / Decimal::from(bars.len())).round_dp(6)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn start() -> NaiveDate {
        NaiveDate::from_ymd_opt(2023, 1, 2).unwrap()
    }

    fn oscillating_bars(symbol: &str, days: i64, period: f64) -> Vec<Candle> {
        let mut prev = dec!(100);
        (0..days)
            .map(|i| {
                let date = start() + Duration::days(i);
                let wave = (i as f64 * std::f64::consts::TAU / period).sin() * 8.0;
                let close = Decimal::from_f64_retain(100.0 + wave)
                    .unwrap()
                    .round_dp(2);
                let bar = Candle {
                    symbol: symbol.to_string(),
                    open: prev,
                    high: close.max(prev) * dec!(1.005),
                    low: close.min(prev) * dec!(0.995),
                    close,
                    volume: dec!(1000),
                    timestamp: date.and_hms_opt(0, 0, 0).unwrap().and_utc().timestamp(),
                };
                prev = close;
                bar
            })
            .collect()
    }

    fn request(symbols: &[&str], days: i64) -> BacktestRequest {
        BacktestRequest {
            parameters: StrategyParameters::default(),
            symbols: symbols.iter().map(|s| s.to_string()).collect(),
            date_range: DateRange::new(start() + Duration::days(30), start() + Duration::days(days - 1))
                .unwrap(),
            capital: CapitalSchedule::lump_sum(dec!(10000)),
            cost_model: CostModel {
                fee_bps: dec!(5),
                slippage_bps: dec!(5),
                slippage_jitter_bps: dec!(10),
                max_position_size: None,
                seed: 99,
            },
        }
    }

    fn simulator(days: i64) -> BacktestSimulator {
        let mut bars = BarSet::new();
        bars.insert("AAA".to_string(), oscillating_bars("AAA", days, 20.0));
        bars.insert("BBB".to_string(), oscillating_bars("BBB", days, 27.0));
        BacktestSimulator::new(bars)
    }

    #[test]
    fn test_identical_inputs_produce_identical_output() {
        let sim = simulator(200);
        let req = request(&["AAA", "BBB"], 200);
        let a = serde_json::to_string(&sim.run(&req).unwrap()).unwrap();
        let b = serde_json::to_string(&sim.run(&req).unwrap()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_oscillating_market_produces_trades() {
        let sim = simulator(200);
        let result = sim.run(&request(&["AAA", "BBB"], 200)).unwrap();
        assert!(result.metrics.total_trades > 0);
        assert!(result.metrics.total_fees > Decimal::ZERO);
        // every trade closed, so the account is all cash at the end
        let last = result.equity_curve.last().unwrap();
        assert_eq!(last.positions_value, Decimal::ZERO);
        assert_eq!(result.final_capital, last.equity);
    }

    #[test]
    fn test_one_equity_point_per_session() {
        let sim = simulator(120);
        let req = request(&["AAA"], 120);
        let result = sim.run(&req).unwrap();
        assert_eq!(result.equity_curve.len(), sim.sessions_in(&req.symbols, &req.date_range).len());
        assert_eq!(result.diagnostics.sessions, result.equity_curve.len());
        let dates: BTreeSet<NaiveDate> = result.equity_curve.iter().map(|p| p.date).collect();
        assert_eq!(dates.len(), result.equity_curve.len());
    }

    #[test]
    fn test_no_reentry_on_exit_bar() {
        let sim = simulator(250);
        let result = sim.run(&request(&["AAA", "BBB"], 250)).unwrap();
        for exit in &result.trades {
            let reentered = result.trades.iter().any(|t| {
                t.symbol == exit.symbol && t.entry_date == exit.exit_date
            });
            assert!(!reentered, "re-entered {} on {}", exit.symbol, exit.exit_date);
        }
    }

    #[test]
    fn test_short_history_symbol_is_excluded_and_reported() {
        let mut bars = BarSet::new();
        bars.insert("AAA".to_string(), oscillating_bars("AAA", 120, 20.0));
        let short: Vec<Candle> = oscillating_bars("NEW", 120, 20.0)
            .into_iter()
            .skip(110)
            .collect();
        bars.insert("NEW".to_string(), short);
        let sim = BacktestSimulator::new(bars);

        let result = sim.run(&request(&["AAA", "NEW", "GONE"], 120)).unwrap();
        assert_eq!(result.diagnostics.insufficient_data.get("NEW"), Some(&10));
        assert_eq!(result.diagnostics.symbols_without_data, vec!["GONE".to_string()]);
        assert!(result.trades.iter().all(|t| t.symbol == "AAA"));
    }

    #[test]
    fn test_all_symbols_short_fails_with_insufficient_data() {
        let mut bars = BarSet::new();
        bars.insert(
            "NEW".to_string(),
            oscillating_bars("NEW", 40, 20.0).into_iter().skip(32).collect(),
        );
        let sim = BacktestSimulator::new(bars);
        let err = sim.run(&request(&["NEW"], 40)).unwrap_err();
        assert_eq!(
            err,
            SimulationError::InsufficientData {
                symbols: vec!["NEW".to_string()]
            }
        );
    }

    #[test]
    fn test_monthly_contributions_are_counted() {
        let sim = simulator(200);
        let mut req = request(&["AAA"], 200);
        req.capital.contribution_amount = dec!(500);
        req.capital.contribution_frequency = ContributionFrequency::Monthly;
        let result = sim.run(&req).unwrap();
        assert!(result.diagnostics.contributions_made >= 4);
        assert_eq!(
            result.total_contributed,
            dec!(10000) + dec!(500) * Decimal::from(result.diagnostics.contributions_made)
        );
    }

    struct StopAfter {
        seen: AtomicUsize,
        limit: usize,
    }

    impl SimulationObserver for StopAfter {
        fn on_session(&self, _completed: usize, _total: usize) -> bool {
            self.seen.fetch_add(1, Ordering::SeqCst) + 1 < self.limit
        }
    }

    #[test]
    fn test_observer_can_cancel_mid_run() {
        let sim = simulator(120);
        let observer = StopAfter {
            seen: AtomicUsize::new(0),
            limit: 3,
        };
        let err = sim
            .run_observed(&request(&["AAA"], 120), &observer)
            .unwrap_err();
        assert_eq!(err, SimulationError::Canceled);
        assert_eq!(observer.seen.load(Ordering::SeqCst), 3);
    }
}
