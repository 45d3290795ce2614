use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{error, info, warn};

pub mod shutdown_service;

use crate::application::bootstrap::{PersistenceBootstrap, PersistenceHandle};
use crate::application::optimization::scheduler::OptimizationJobScheduler;
use crate::application::optimization::search::ParameterSearchEngine;
use crate::application::runner::{RunnerRepositories, RunnerStartOptions, StrategyRunner};
use crate::application::safety::SafetyController;
use crate::application::system::shutdown_service::{ShutdownConfig, ShutdownService};
use crate::application::trading::OrderExecutor;
use crate::config::Config;
use crate::domain::errors::RunnerError;
use crate::domain::ports::{BrokerClient, MarketDataProvider};
use crate::infrastructure::mock::{PaperBroker, SyntheticMarketData};
use crate::infrastructure::observability::Metrics;

/// Seed of the synthetic market data used by the headless binaries
pub const SYNTHETIC_DATA_SEED: u64 = 42;

/// Owned handles to every long-lived service. Built once per process and
/// passed by reference; nothing here is a global.
pub struct Application {
    pub config: Config,
    pub persistence: PersistenceHandle,
    pub metrics: Metrics,
    pub market_data: Arc<dyn MarketDataProvider>,
    pub broker: Arc<dyn BrokerClient>,
    pub safety: Arc<SafetyController>,
    pub executor: Arc<OrderExecutor>,
    pub runner: Arc<StrategyRunner>,
    pub scheduler: OptimizationJobScheduler,
}

impl Application {
    /// SQLite storage, paper broker and synthetic market data
    pub async fn build(config: Config) -> Result<Self> {
        info!("Building StocksBot Application...");
        let persistence = PersistenceBootstrap::init(&config.database_url).await?;
        let market_data: Arc<dyn MarketDataProvider> =
            Arc::new(SyntheticMarketData::new(SYNTHETIC_DATA_SEED));
        let broker: Arc<dyn BrokerClient> = Arc::new(PaperBroker::new(
            market_data.clone(),
            config.paper_starting_cash,
        ));
        Self::assemble(config, persistence, market_data, broker)
    }

    /// Wire services over the given storage and upstreams
    pub fn assemble(
        config: Config,
        persistence: PersistenceHandle,
        market_data: Arc<dyn MarketDataProvider>,
        broker: Arc<dyn BrokerClient>,
    ) -> Result<Self> {
        let metrics = Metrics::new().context("Failed to register metrics")?;

        let safety = Arc::new(
            SafetyController::new(
                broker.clone(),
                persistence.audit_sink.clone(),
                config.safety.clone(),
            )
            .with_metrics(metrics.clone()),
        );

        let executor = Arc::new(
            OrderExecutor::new(
                broker.clone(),
                market_data.clone(),
                safety.clone(),
                persistence.order_repository.clone(),
                persistence.trade_repository.clone(),
                persistence.position_repository.clone(),
                persistence.audit_sink.clone(),
            )
            .with_metrics(metrics.clone()),
        );

        let runner = Arc::new(
            StrategyRunner::new(
                config.runner.clone(),
                broker.clone(),
                market_data.clone(),
                executor.clone(),
                RunnerRepositories {
                    strategies: persistence.strategy_repository.clone(),
                    runner_state: persistence.runner_state_repository.clone(),
                    positions: persistence.position_repository.clone(),
                },
                persistence.audit_sink.clone(),
            )
            .with_metrics(metrics.clone()),
        );
        safety.bind_runner(&runner);

        let scheduler = OptimizationJobScheduler::with_metrics(
            Arc::new(ParameterSearchEngine::new(market_data.clone())),
            persistence.job_history_repository.clone(),
            config.scheduler.clone(),
            metrics.clone(),
        );

        Ok(Self {
            config,
            persistence,
            metrics,
            market_data,
            broker,
            safety,
            executor,
            runner,
            scheduler,
        })
    }

    /// Recover job history, connect the broker and start the runner.
    ///
    /// A missing strategy set leaves the runner stopped; everything else
    /// still starts.
    pub async fn start(&self) -> Result<()> {
        let recovered = self
            .scheduler
            .recover()
            .await
            .context("Failed to reconcile optimization job history")?;
        if recovered > 0 {
            warn!(
                "Reconciled {} optimization jobs left over from a previous process",
                recovered
            );
        }

        self.broker
            .connect()
            .await
            .context("Failed to connect to broker")?;

        match self.runner.start(RunnerStartOptions::default()).await {
            Ok(result) => info!("{}", result.message),
            Err(RunnerError::NoStrategiesLoaded) => {
                warn!("No active strategies configured; strategy runner left stopped")
            }
            Err(e @ (RunnerError::RequiresReset | RunnerError::CorruptedState { .. })) => {
                error!("Strategy runner left in ERROR: {}", e)
            }
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    pub fn shutdown_service(&self) -> ShutdownService {
        let grace = self.config.scheduler.force_cancel_grace();
        ShutdownService::new(
            self.runner.clone(),
            self.scheduler.clone(),
            self.broker.clone(),
            ShutdownConfig {
                force_cancel_jobs: true,
                drain_timeout: grace + grace,
            },
        )
    }
}
