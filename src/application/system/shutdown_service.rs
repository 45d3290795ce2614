use crate::application::optimization::scheduler::OptimizationJobScheduler;
use crate::application::runner::StrategyRunner;
use crate::domain::ports::BrokerClient;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy)]
pub struct ShutdownConfig {
    /// Force-cancel running jobs instead of waiting for them to yield
    pub force_cancel_jobs: bool,
    pub drain_timeout: Duration,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            force_cancel_jobs: true,
            drain_timeout: Duration::from_secs(15),
        }
    }
}

/// What the shutdown sequence managed to do
#[derive(Debug, Clone, PartialEq)]
pub struct ShutdownSummary {
    pub runner_stopped: bool,
    pub jobs_canceled: usize,
    pub jobs_drained: bool,
}

pub struct ShutdownService {
    runner: Arc<StrategyRunner>,
    scheduler: OptimizationJobScheduler,
    broker: Arc<dyn BrokerClient>,
    config: ShutdownConfig,
}

impl ShutdownService {
    pub fn new(
        runner: Arc<StrategyRunner>,
        scheduler: OptimizationJobScheduler,
        broker: Arc<dyn BrokerClient>,
        config: ShutdownConfig,
    ) -> Self {
        Self {
            runner,
            scheduler,
            broker,
            config,
        }
    }

    /// Stop the runner, cancel optimization jobs, wait for their rows to be
    /// written, then disconnect from the broker.
    pub async fn shutdown(&self) -> ShutdownSummary {
        info!("Initiating Graceful Shutdown Sequence...");

        info!("Step 1: Stopping strategy runner...");
        let stop = self.runner.stop().await;
        info!("Runner: {}", stop.message);

        info!("Step 2: Canceling active optimization jobs...");
        let outcomes = self
            .scheduler
            .cancel_all(self.config.force_cancel_jobs)
            .await;
        let jobs_canceled = outcomes.iter().filter(|o| o.success).count();
        info!("{} jobs canceled", jobs_canceled);

        info!("Step 3: Waiting for job state to be persisted...");
        let jobs_drained = self.scheduler.drain(self.config.drain_timeout).await;
        if !jobs_drained {
            warn!(
                "{} jobs still active after {:?}; recovery will fail them on next start",
                self.scheduler.active_count(),
                self.config.drain_timeout
            );
        }

        info!("Step 4: Disconnecting broker...");
        if let Err(e) = self.broker.disconnect().await {
            error!("Failed to disconnect broker during shutdown: {}", e);
        }

        info!("Graceful Shutdown Complete. Goodbye!");
        ShutdownSummary {
            runner_stopped: stop.success,
            jobs_canceled,
            jobs_drained,
        }
    }
}
