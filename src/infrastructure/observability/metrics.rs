//! Prometheus metrics definitions for StocksBot
//!
//! All metrics use the `stocksbot_` prefix and are read-only.

use prometheus::{
    CounterVec, Gauge, GaugeVec, IntCounterVec, Opts, Registry, TextEncoder,
    core::{AtomicF64, GenericGauge, GenericGaugeVec},
};
use std::sync::Arc;

/// Runner modes exported as one gauge series each
const RUNNER_MODES: [&str; 5] = ["STOPPED", "RUNNING", "SLEEPING", "PAUSED", "ERROR"];

/// Prometheus metrics for the runner, the scheduler and order flow
#[derive(Clone)]
pub struct Metrics {
    registry: Arc<Registry>,
    /// Runner ticks by outcome (success, poll_error, sleeping, fatal)
    pub runner_ticks_total: IntCounterVec,
    /// 1 for the current runner mode, 0 for the others
    pub runner_mode: GenericGaugeVec<AtomicF64>,
    /// Optimization jobs reaching a status
    pub jobs_total: IntCounterVec,
    /// Jobs currently queued or running
    pub jobs_active: GenericGauge<AtomicF64>,
    /// Total orders counter by side and status
    pub orders_total: CounterVec,
    /// Preflight denials by reason
    pub preflight_denials_total: IntCounterVec,
    /// Kill switch status (0=off, 1=active)
    pub kill_switch_status: GenericGauge<AtomicF64>,
    /// Uptime in seconds
    pub uptime_seconds: GenericGauge<AtomicF64>,
}

impl Metrics {
    /// Create a new Metrics instance with all gauges and counters registered
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let runner_ticks_total = IntCounterVec::new(
            Opts::new("stocksbot_runner_ticks_total", "Runner ticks by outcome"),
            &["outcome"],
        )?;
        registry.register(Box::new(runner_ticks_total.clone()))?;

        let runner_mode = GaugeVec::new(
            Opts::new("stocksbot_runner_mode", "Current runner mode (1=active)"),
            &["mode"],
        )?;
        registry.register(Box::new(runner_mode.clone()))?;

        let jobs_total = IntCounterVec::new(
            Opts::new("stocksbot_optimizer_jobs_total", "Optimization jobs by status"),
            &["status"],
        )?;
        registry.register(Box::new(jobs_total.clone()))?;

        let jobs_active = Gauge::with_opts(Opts::new(
            "stocksbot_optimizer_jobs_active",
            "Optimization jobs queued or running",
        ))?;
        registry.register(Box::new(jobs_active.clone()))?;

        let orders_total = CounterVec::new(
            Opts::new("stocksbot_orders_total", "Total orders by side and status"),
            &["side", "status"],
        )?;
        registry.register(Box::new(orders_total.clone()))?;

        let preflight_denials_total = IntCounterVec::new(
            Opts::new(
                "stocksbot_preflight_denials_total",
                "Order submissions denied by preflight",
            ),
            &["reason"],
        )?;
        registry.register(Box::new(preflight_denials_total.clone()))?;

        let kill_switch_status = Gauge::with_opts(Opts::new(
            "stocksbot_kill_switch_status",
            "Kill switch status (0=off, 1=active)",
        ))?;
        registry.register(Box::new(kill_switch_status.clone()))?;

        let uptime_seconds = Gauge::with_opts(Opts::new(
            "stocksbot_uptime_seconds",
            "Server uptime in seconds",
        ))?;
        registry.register(Box::new(uptime_seconds.clone()))?;

        Ok(Self {
            registry: Arc::new(registry),
            runner_ticks_total,
            runner_mode,
            jobs_total,
            jobs_active,
            orders_total,
            preflight_denials_total,
            kill_switch_status,
            uptime_seconds,
        })
    }

    /// Render all metrics in Prometheus text format
    pub fn render(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        encoder
            .encode_to_string(&metric_families)
            .unwrap_or_default()
    }

    pub fn inc_ticks(&self, outcome: &str) {
        self.runner_ticks_total.with_label_values(&[outcome]).inc();
    }

    /// Set the gauge for `mode` to 1 and every other mode to 0
    pub fn set_runner_mode(&self, mode: &str) {
        for candidate in RUNNER_MODES {
            let value = if candidate == mode { 1.0 } else { 0.0 };
            self.runner_mode.with_label_values(&[candidate]).set(value);
        }
    }

    pub fn inc_jobs(&self, status: &str) {
        self.jobs_total.with_label_values(&[status]).inc();
    }

    /// Increment order counter
    pub fn inc_orders(&self, side: &str, status: &str) {
        self.orders_total.with_label_values(&[side, status]).inc();
    }

    pub fn inc_preflight_denials(&self, reason: &str) {
        self.preflight_denials_total
            .with_label_values(&[reason])
            .inc();
    }
}
