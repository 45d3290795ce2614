//! Live scheduling loop.
//!
//! One background task ticks on a fixed interval. Each tick checks the
//! market session, sleeps or resumes, evaluates the attached strategies and
//! routes their signals through the `OrderExecutor`. A failing tick is
//! counted and the loop carries on; only a fatal fault moves the runner to
//! ERROR, which needs an explicit stop before the next start.

use crate::application::runner::reconciliation::reconcile_positions;
use crate::application::strategies::{LiveStrategy, Signal, SignalKind, StrategyFactory};
use crate::application::trading::OrderExecutor;
use crate::config::RunnerEnvConfig;
use crate::domain::errors::{ExecutionError, RunnerError};
use crate::domain::ports::{AuditSink, BrokerClient, MarketDataProvider};
use crate::domain::repositories::{PositionRepository, RunnerStateRepository, StrategyRepository};
use crate::domain::runner::market_calendar::next_regular_open;
use crate::domain::runner::{RunnerCommandResult, RunnerMode, RunnerState};
use crate::domain::trading::types::{OrderRequest, OrderSide, Quote};
use crate::infrastructure::observability::Metrics;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::json;
use std::collections::BTreeSet;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Options accepted by `StrategyRunner::start`
#[derive(Debug, Clone, Default)]
pub struct RunnerStartOptions {
    /// Overrides the configured tick interval for this run
    pub tick_interval_seconds: Option<u64>,
}

/// Storage the runner reads and writes
#[derive(Clone)]
pub struct RunnerRepositories {
    pub strategies: Arc<dyn StrategyRepository>,
    pub runner_state: Arc<dyn RunnerStateRepository>,
    pub positions: Arc<dyn PositionRepository>,
}

struct LoopHandle {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

#[derive(Debug)]
enum TickOutcome {
    Evaluated,
    Sleeping,
    Paused,
    PollError,
    Fatal(String),
}

pub struct StrategyRunner {
    config: RunnerEnvConfig,
    broker: Arc<dyn BrokerClient>,
    market_data: Arc<dyn MarketDataProvider>,
    executor: Arc<OrderExecutor>,
    repositories: RunnerRepositories,
    audit: Arc<dyn AuditSink>,
    metrics: Option<Metrics>,
    state: RwLock<RunnerState>,
    strategies: Mutex<Vec<Box<dyn LiveStrategy>>>,
    control: Mutex<Option<LoopHandle>>,
    ticks_since_persist: AtomicU64,
}

impl StrategyRunner {
    pub fn new(
        config: RunnerEnvConfig,
        broker: Arc<dyn BrokerClient>,
        market_data: Arc<dyn MarketDataProvider>,
        executor: Arc<OrderExecutor>,
        repositories: RunnerRepositories,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        let state = RunnerState::new(config.tick_interval_seconds as f64);
        Self {
            config,
            broker,
            market_data,
            executor,
            repositories,
            audit,
            metrics: None,
            state: RwLock::new(state),
            strategies: Mutex::new(Vec::new()),
            control: Mutex::new(None),
            ticks_since_persist: AtomicU64::new(0),
        }
    }

    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Snapshot of the runner state. Never waits on an in-flight tick.
    pub fn status(&self) -> RunnerState {
        self.state.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn mode(&self) -> RunnerMode {
        self.state.read().unwrap_or_else(|e| e.into_inner()).mode
    }

    fn update_state<R>(&self, f: impl FnOnce(&mut RunnerState) -> R) -> R {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        f(&mut state)
    }

    /// Add a strategy for the next start. Ignored while the loop runs.
    pub async fn attach_strategy(&self, strategy: Box<dyn LiveStrategy>) {
        info!(
            "StrategyRunner: attached {} ({})",
            strategy.name(),
            strategy.id()
        );
        self.strategies.lock().await.push(strategy);
    }

    pub async fn strategy_count(&self) -> usize {
        self.strategies.lock().await.len()
    }

    fn result(&self, success: bool, message: impl Into<String>) -> RunnerCommandResult {
        RunnerCommandResult {
            success,
            message: message.into(),
            status: self.status(),
        }
    }

    /// Start the scheduling loop.
    ///
    /// Starting an active runner returns its status unchanged. Starting from
    /// ERROR fails with `RequiresReset`.
    pub async fn start(
        self: &Arc<Self>,
        options: RunnerStartOptions,
    ) -> Result<RunnerCommandResult, RunnerError> {
        let mut control = self.control.lock().await;
        let mode = self.mode();
        if mode == RunnerMode::Error {
            return Err(RunnerError::RequiresReset);
        }
        if mode.is_active() && control.is_some() {
            return Ok(self.result(true, format!("Runner already {}", mode)));
        }

        self.load_strategies().await;
        if self.strategies.lock().await.is_empty() {
            return Err(RunnerError::NoStrategiesLoaded);
        }

        if let Err(reason) = self.restore_checkpoint().await {
            self.enter_error(&reason).await;
            return Err(RunnerError::CorruptedState { reason });
        }
        if self.mode() == RunnerMode::Error {
            warn!(
                "StrategyRunner: persisted checkpoint is ERROR ({}); stop the runner to reset it",
                self.status().last_error.as_deref().unwrap_or("no reason recorded")
            );
            self.observe_mode(RunnerMode::Error);
            return Err(RunnerError::RequiresReset);
        }

        let interval = options
            .tick_interval_seconds
            .unwrap_or(self.config.tick_interval_seconds)
            .max(1);
        self.update_state(|s| s.tick_interval_seconds = interval as f64);

        let names: Vec<String> = {
            let mut strategies = self.strategies.lock().await;
            for strategy in strategies.iter_mut() {
                strategy.on_start();
            }
            strategies.iter().map(|s| s.id().to_string()).collect()
        };

        let token = CancellationToken::new();
        let runner = Arc::clone(self);
        let loop_token = token.clone();
        let handle = tokio::spawn(async move {
            runner
                .run_loop(Duration::from_secs(interval), loop_token)
                .await
        });
        *control = Some(LoopHandle { token, handle });

        let status = self.status();
        info!(
            "StrategyRunner: started in {} with {} strategies, tick every {}s",
            status.mode,
            names.len(),
            interval
        );
        self.observe_mode(status.mode);
        self.persist().await;
        self.record(
            "runner_started",
            "Strategy runner started",
            json!({ "strategies": names, "tick_interval_seconds": interval, "mode": status.mode }),
        )
        .await;

        Ok(self.result(true, format!("Runner started ({})", status.mode)))
    }

    /// Stop after the current tick completes. Stopping a stopped runner is a
    /// no-op; stopping from ERROR clears it.
    pub async fn stop(&self) -> RunnerCommandResult {
        let mut control = self.control.lock().await;
        let Some(LoopHandle { token, handle }) = control.take() else {
            if self.mode() == RunnerMode::Error {
                self.update_state(|s| s.mark_stopped());
                self.observe_mode(RunnerMode::Stopped);
                self.persist().await;
                return self.result(true, "Runner reset from ERROR");
            }
            return self.result(true, "Runner already stopped");
        };

        info!("StrategyRunner: stop requested, draining current tick");
        token.cancel();
        if let Err(e) = handle.await {
            error!("StrategyRunner: loop task ended abnormally: {}", e);
        }

        for strategy in self.strategies.lock().await.iter_mut() {
            strategy.on_stop();
        }
        self.update_state(|s| s.mark_stopped());
        self.observe_mode(RunnerMode::Stopped);
        self.persist().await;
        self.record("runner_stopped", "Strategy runner stopped", json!({}))
            .await;
        info!("StrategyRunner: stopped");
        self.result(true, "Runner stopped")
    }

    /// Suspend strategy evaluation; the loop keeps running
    pub async fn pause(&self) -> RunnerCommandResult {
        let _control = self.control.lock().await;
        let paused = self.update_state(|s| {
            if matches!(s.mode, RunnerMode::Running | RunnerMode::Sleeping) {
                s.mode = RunnerMode::Paused;
                s.sleep_since = None;
                s.next_market_open_at = None;
                true
            } else {
                false
            }
        });
        if !paused {
            return self.result(false, format!("Cannot pause from {}", self.mode()));
        }
        self.observe_mode(RunnerMode::Paused);
        self.persist().await;
        self.result(true, "Runner paused")
    }

    pub async fn resume(&self) -> RunnerCommandResult {
        let _control = self.control.lock().await;
        let resumed = self.update_state(|s| {
            if s.mode == RunnerMode::Paused {
                s.mode = RunnerMode::Running;
                true
            } else {
                false
            }
        });
        if !resumed {
            return self.result(false, format!("Cannot resume from {}", self.mode()));
        }
        self.observe_mode(RunnerMode::Running);
        self.persist().await;
        self.result(true, "Runner resumed")
    }

    async fn load_strategies(&self) {
        let mut strategies = self.strategies.lock().await;
        if !strategies.is_empty() {
            return;
        }
        let records = match self.repositories.strategies.list_active_strategies().await {
            Ok(records) => records,
            Err(e) => {
                warn!("StrategyRunner: cannot load strategies: {}", e);
                return;
            }
        };
        for record in records {
            match StrategyFactory::create(&record) {
                Ok(strategy) => strategies.push(strategy),
                Err(e) => warn!("StrategyRunner: skipping strategy {}: {}", record.id, e),
            }
        }
    }

    /// Load the persisted checkpoint into the live state.
    ///
    /// `Err` carries the reason the checkpoint is unusable.
    async fn restore_checkpoint(&self) -> Result<(), String> {
        let persisted = self
            .repositories
            .runner_state
            .load_runner_state()
            .await
            .map_err(|e| format!("{:#}", e))?;

        match persisted {
            Some(persisted) => {
                persisted.validate()?;
                self.update_state(|s| s.restore_from(&persisted));
                if persisted.mode == RunnerMode::Sleeping {
                    info!(
                        "StrategyRunner: restored SLEEPING checkpoint (since {:?})",
                        persisted.sleep_since
                    );
                }
            }
            None => self.update_state(|s| s.mode = RunnerMode::Running),
        }
        Ok(())
    }

    async fn run_loop(self: Arc<Self>, period: Duration, token: CancellationToken) {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = interval.tick() => {}
            }

            let outcome = self.tick().await;
            debug!("StrategyRunner: tick outcome {:?}", outcome);
            if let Some(metrics) = &self.metrics {
                metrics.inc_ticks(match &outcome {
                    TickOutcome::Evaluated => "success",
                    TickOutcome::Sleeping => "sleeping",
                    TickOutcome::Paused => "paused",
                    TickOutcome::PollError => "poll_error",
                    TickOutcome::Fatal(_) => "fatal",
                });
            }
            if let TickOutcome::Fatal(reason) = outcome {
                self.enter_error(&reason).await;
                break;
            }
        }
        debug!("StrategyRunner: loop exited");
    }

    /// Bound an upstream call by the configured timeout
    async fn upstream<T>(&self, what: &str, call: impl Future<Output = Result<T>>) -> Result<T> {
        match tokio::time::timeout(self.config.upstream_timeout(), call).await {
            Ok(result) => result.with_context(|| format!("{} failed", what)),
            Err(_) => anyhow::bail!(
                "{} timed out after {}ms",
                what,
                self.config.upstream_timeout_ms
            ),
        }
    }

    async fn tick(&self) -> TickOutcome {
        let now = Utc::now();
        if self.mode() == RunnerMode::Paused {
            return TickOutcome::Paused;
        }

        let open = match self
            .upstream("Market status", self.broker.is_market_open())
            .await
        {
            Ok(open) => open,
            Err(e) => return self.poll_failed(now, e).await,
        };

        if !open {
            if self.mode() == RunnerMode::Running {
                self.go_to_sleep(now).await;
            }
            self.update_state(|s| s.record_poll_success(now));
            self.persist_on_cadence().await;
            return TickOutcome::Sleeping;
        }

        if self.mode() == RunnerMode::Sleeping {
            self.wake_up(now).await;
        }

        match self.evaluate_strategies().await {
            Ok(()) => {}
            Err(EvaluationError::Poll(e)) => return self.poll_failed(now, e).await,
            Err(EvaluationError::Fatal(reason)) => return TickOutcome::Fatal(reason),
        }

        self.update_state(|s| s.record_poll_success(now));
        self.persist_on_cadence().await;
        TickOutcome::Evaluated
    }

    async fn poll_failed(&self, now: DateTime<Utc>, error: anyhow::Error) -> TickOutcome {
        let message = format!("{:#}", error);
        warn!("StrategyRunner: poll error: {}", message);
        self.update_state(|s| s.record_poll_error(now, message));
        self.persist_on_cadence().await;
        TickOutcome::PollError
    }

    async fn go_to_sleep(&self, now: DateTime<Utc>) {
        let next_open = match self
            .upstream("Market clock", self.broker.next_market_open())
            .await
        {
            Ok(Some(at)) => at,
            Ok(None) => next_regular_open(now),
            Err(e) => {
                debug!("StrategyRunner: market clock unavailable: {:#}", e);
                next_regular_open(now)
            }
        };

        if self.update_state(|s| s.enter_sleep(now, Some(next_open))) {
            info!(
                "StrategyRunner: market closed, entering SLEEPING until {}",
                next_open
            );
            self.observe_mode(RunnerMode::Sleeping);
            self.persist().await;
            self.record(
                "runner_sleeping",
                "Market closed; runner sleeping",
                json!({ "next_market_open_at": next_open }),
            )
            .await;
        }
    }

    async fn wake_up(&self, now: DateTime<Utc>) {
        let slept_since = self.status().sleep_since;
        if !self.update_state(|s| s.resume(now)) {
            return;
        }
        let resume_count = self.status().resume_count;
        info!(
            "StrategyRunner: market open, resuming (resume #{})",
            resume_count
        );
        self.observe_mode(RunnerMode::Running);
        self.persist().await;
        self.record(
            "runner_resumed",
            "Market open; runner resumed",
            json!({ "sleep_since": slept_since, "resume_count": resume_count }),
        )
        .await;

        if self.config.reconcile_on_resume {
            self.reconcile().await;
        }
    }

    async fn reconcile(&self) {
        let outcome = self
            .upstream(
                "Position reconciliation",
                reconcile_positions(
                    self.broker.as_ref(),
                    self.repositories.positions.as_ref(),
                ),
            )
            .await;
        match outcome {
            Ok(drift) if drift.is_empty() => {
                info!("StrategyRunner: reconciliation found no drift");
            }
            Ok(drift) => {
                warn!(
                    "StrategyRunner: reconciliation repaired {} drifted positions",
                    drift.len()
                );
                self.record(
                    "reconciliation_drift",
                    &format!("{} positions drifted while asleep", drift.len()),
                    serde_json::to_value(&drift).unwrap_or_else(|_| json!([])),
                )
                .await;
            }
            Err(e) => warn!("StrategyRunner: reconciliation failed: {:#}", e),
        }
    }

    async fn fetch_quotes(&self, symbols: &BTreeSet<String>) -> Result<Vec<Quote>> {
        let mut quotes = Vec::with_capacity(symbols.len());
        for symbol in symbols {
            let quote = self
                .upstream(
                    &format!("Quote for {}", symbol),
                    self.market_data.latest_quote(symbol),
                )
                .await?;
            quotes.push(quote);
        }
        Ok(quotes)
    }

    async fn evaluate_strategies(&self) -> Result<(), EvaluationError> {
        let mut strategies = self.strategies.lock().await;
        let symbols: BTreeSet<String> = strategies
            .iter()
            .flat_map(|s| s.symbols().iter().cloned())
            .collect();
        let quotes = self
            .fetch_quotes(&symbols)
            .await
            .map_err(EvaluationError::Poll)?;

        let mut signals: Vec<(String, Signal)> = Vec::new();
        for strategy in strategies.iter_mut() {
            let id = strategy.id().to_string();
            let emitted = std::panic::catch_unwind(AssertUnwindSafe(|| strategy.on_tick(&quotes)))
                .map_err(|payload| {
                    let reason = panic_message(payload.as_ref());
                    error!("StrategyRunner: strategy {} panicked: {}", id, reason);
                    EvaluationError::Fatal(
                        RunnerError::StrategyFault {
                            strategy_id: id.clone(),
                            reason,
                        }
                        .to_string(),
                    )
                })?;
            signals.extend(emitted.into_iter().map(|s| (id.clone(), s)));
        }
        drop(strategies);

        // Exits before entries
        signals.sort_by_key(|(_, s)| match s.kind {
            SignalKind::Close | SignalKind::Sell => 0,
            SignalKind::Buy | SignalKind::Hold => 1,
        });

        let mut first_failure = None;
        for (strategy_id, signal) in signals {
            if let Err(e) = self.execute_signal(&strategy_id, signal).await {
                first_failure.get_or_insert(e);
            }
        }
        match first_failure {
            Some(e) => Err(EvaluationError::Poll(e)),
            None => Ok(()),
        }
    }

    /// Route one signal to the executor. Denials are recorded as skips;
    /// broker failures surface as a poll error.
    async fn execute_signal(&self, strategy_id: &str, signal: Signal) -> Result<()> {
        let request = match signal.kind {
            SignalKind::Hold => return Ok(()),
            SignalKind::Close => {
                let held = self
                    .upstream("Positions", self.broker.get_positions())
                    .await?
                    .into_iter()
                    .find(|p| p.symbol == signal.symbol);
                match held {
                    Some(position) if !position.quantity.is_zero() => OrderRequest::market(
                        signal.symbol.clone(),
                        position.side().opposite(),
                        position.quantity.abs(),
                    ),
                    _ => {
                        self.skip(format!("No position to close for {}", signal.symbol));
                        return Ok(());
                    }
                }
            }
            SignalKind::Buy | SignalKind::Sell => {
                let side = if signal.kind == SignalKind::Buy {
                    OrderSide::Buy
                } else {
                    OrderSide::Sell
                };
                let mut request = OrderRequest::market(signal.symbol.clone(), side, signal.quantity);
                request.order_type = signal.order_type;
                request.limit_price = signal.limit_price;
                request
            }
        };
        let mut request = request;
        request.strategy_id = Some(strategy_id.to_string());

        match self.executor.submit(request).await {
            Ok(report) => {
                info!(
                    "StrategyRunner: {} {} -> {} ({})",
                    strategy_id, signal.symbol, report.order.status, signal.reason
                );
                self.update_state(|s| s.orders_submitted += 1);
                Ok(())
            }
            Err(ExecutionError::Broker(e)) => Err(e.context(format!(
                "Order for {} from {} failed",
                signal.symbol, strategy_id
            ))),
            Err(denied) => {
                self.skip(format!("{} {}: {}", strategy_id, signal.symbol, denied));
                Ok(())
            }
        }
    }

    fn skip(&self, reason: String) {
        info!("StrategyRunner: signal skipped: {}", reason);
        self.update_state(|s| s.record_skip(reason));
    }

    async fn enter_error(&self, reason: &str) {
        error!("StrategyRunner: entering ERROR: {}", reason);
        self.update_state(|s| s.mark_error(reason));
        self.observe_mode(RunnerMode::Error);
        self.persist().await;
        self.record("runner_error", reason, json!({ "reason": reason }))
            .await;
    }

    async fn persist_on_cadence(&self) {
        let ticks = self.ticks_since_persist.fetch_add(1, Ordering::SeqCst) + 1;
        if ticks >= self.config.persist_every_ticks {
            self.persist().await;
        }
    }

    /// Write the checkpoint. Failures are logged; the loop never stops for them.
    async fn persist(&self) {
        self.ticks_since_persist.store(0, Ordering::SeqCst);
        let snapshot = self.update_state(|s| {
            s.last_state_persisted_at = Some(Utc::now());
            s.clone()
        });
        if let Err(e) = self
            .repositories
            .runner_state
            .save_runner_state(&snapshot)
            .await
        {
            warn!("StrategyRunner: failed to persist state: {:#}", e);
        }
    }

    fn observe_mode(&self, mode: RunnerMode) {
        if let Some(metrics) = &self.metrics {
            metrics.set_runner_mode(&mode.to_string());
        }
    }

    async fn record(&self, event_type: &str, description: &str, details: serde_json::Value) {
        if let Err(e) = self.audit.record(event_type, description, details).await {
            warn!("StrategyRunner: audit write for {} failed: {}", event_type, e);
        }
    }
}

enum EvaluationError {
    Poll(anyhow::Error),
    Fatal(String),
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
