//! Push-based status reporter
//!
//! Periodically writes a JSON snapshot of the runner, the optimizer and the
//! safety gate to stdout. Nothing listens for requests.

use crate::application::optimization::scheduler::OptimizationJobScheduler;
use crate::application::runner::StrategyRunner;
use crate::application::safety::SafetyController;
use crate::infrastructure::observability::metrics::Metrics;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Metrics snapshot for JSON output
#[derive(Serialize)]
pub struct MetricsSnapshot {
    pub timestamp: String,
    pub uptime_seconds: u64,
    pub version: String,
    pub runner: RunnerSnapshot,
    pub optimizer: OptimizerSnapshot,
    pub safety: SafetySnapshot,
}

#[derive(Serialize)]
pub struct RunnerSnapshot {
    pub mode: String,
    pub poll_success_count: u64,
    pub poll_error_count: u64,
    pub orders_submitted: u64,
    pub signals_skipped: u64,
    pub resume_count: u64,
    pub last_poll_error: Option<String>,
}

#[derive(Serialize)]
pub struct OptimizerSnapshot {
    pub active_jobs: usize,
    pub stalled_jobs: Vec<String>,
    pub max_workers: usize,
}

#[derive(Serialize)]
pub struct SafetySnapshot {
    pub kill_switch_active: bool,
    pub trading_enabled: bool,
}

pub struct MetricsReporter {
    runner: Arc<StrategyRunner>,
    scheduler: OptimizationJobScheduler,
    safety: Arc<SafetyController>,
    metrics: Metrics,
    start_time: Instant,
    interval: Duration,
}

impl MetricsReporter {
    pub fn new(
        runner: Arc<StrategyRunner>,
        scheduler: OptimizationJobScheduler,
        safety: Arc<SafetyController>,
        metrics: Metrics,
        interval_seconds: u64,
    ) -> Self {
        Self {
            runner,
            scheduler,
            safety,
            metrics,
            start_time: Instant::now(),
            interval: Duration::from_secs(interval_seconds.max(1)),
        }
    }

    /// Run the reporter in a loop, outputting metrics periodically
    pub async fn run(self) {
        info!(
            "MetricsReporter: Starting push-based metrics (interval: {:?})",
            self.interval
        );

        loop {
            tokio::time::sleep(self.interval).await;

            let snapshot = self.collect_snapshot();
            match serde_json::to_string(&snapshot) {
                Ok(json) => {
                    // Prefix so log shippers can pick these lines out
                    println!("METRICS_JSON:{}", json);
                    info!(
                        "Runner: {} | Polls ok/err: {}/{} | Active jobs: {} | Kill switch: {}",
                        snapshot.runner.mode,
                        snapshot.runner.poll_success_count,
                        snapshot.runner.poll_error_count,
                        snapshot.optimizer.active_jobs,
                        snapshot.safety.kill_switch_active
                    );
                    if !snapshot.optimizer.stalled_jobs.is_empty() {
                        warn!(
                            "MetricsReporter: stalled optimization jobs: {}",
                            snapshot.optimizer.stalled_jobs.join(", ")
                        );
                    }
                }
                Err(e) => warn!("Failed to serialize metrics: {}", e),
            }
        }
    }

    fn collect_snapshot(&self) -> MetricsSnapshot {
        let uptime = self.start_time.elapsed().as_secs();
        let state = self.runner.status();
        let active = self.scheduler.list_active();
        let stalled_jobs = active
            .iter()
            .filter(|v| v.stalled)
            .map(|v| v.job.job_id.clone())
            .collect();

        self.metrics.uptime_seconds.set(uptime as f64);
        self.metrics.jobs_active.set(active.len() as f64);

        MetricsSnapshot {
            timestamp: chrono::Utc::now().to_rfc3339(),
            uptime_seconds: uptime,
            version: env!("CARGO_PKG_VERSION").to_string(),
            runner: RunnerSnapshot {
                mode: state.mode.to_string(),
                poll_success_count: state.poll_success_count,
                poll_error_count: state.poll_error_count,
                orders_submitted: state.orders_submitted,
                signals_skipped: state.signals_skipped,
                resume_count: state.resume_count,
                last_poll_error: state.last_poll_error,
            },
            optimizer: OptimizerSnapshot {
                active_jobs: active.len(),
                stalled_jobs,
                max_workers: self.scheduler.config().max_workers,
            },
            safety: SafetySnapshot {
                kill_switch_active: self.safety.is_kill_switch_active(),
                trading_enabled: self.safety.is_trading_enabled(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::bootstrap::PersistenceBootstrap;
    use crate::application::system::Application;
    use crate::config::Config;
    use crate::infrastructure::mock::{PaperBroker, SyntheticMarketData};
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_metrics_snapshot_collection() {
        let market_data = Arc::new(SyntheticMarketData::default());
        let broker = Arc::new(PaperBroker::new(market_data.clone(), dec!(1000)));
        let app = Application::assemble(
            Config::default(),
            PersistenceBootstrap::in_memory(),
            market_data,
            broker,
        )
        .expect("Failed to assemble application");
        app.safety.set_kill_switch(true).await;

        let reporter = MetricsReporter::new(
            app.runner.clone(),
            app.scheduler.clone(),
            app.safety.clone(),
            app.metrics.clone(),
            60,
        );
        let snapshot = reporter.collect_snapshot();

        assert_eq!(snapshot.runner.mode, "STOPPED");
        assert_eq!(snapshot.optimizer.active_jobs, 0);
        assert!(snapshot.safety.kill_switch_active);
        assert!(!snapshot.timestamp.is_empty());

        let json = serde_json::to_string(&snapshot).expect("Failed to serialize");
        assert!(json.contains("\"kill_switch_active\":true"));
    }
}
