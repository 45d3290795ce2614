//! StocksBot Server - headless runner and optimization scheduler
//!
//! Runs the strategy runner against the paper broker and keeps the
//! optimization scheduler available. Status snapshots are pushed as
//! structured JSON lines to stdout.
//!
//! # Usage
//! ```sh
//! OBSERVABILITY_INTERVAL=60 cargo run --bin server
//! ```
//!
//! # Environment Variables
//! - `DATABASE_URL` - SQLite database (default: sqlite://data/stocksbot.db)
//! - `RUNNER_TICK_INTERVAL_SECONDS` - Seconds between runner ticks
//! - `OPTIMIZER_MAX_WORKERS` - Concurrent optimization jobs
//! - `OBSERVABILITY_ENABLED` - Enable metrics reporting (default: true)
//! - `OBSERVABILITY_INTERVAL` - Interval in seconds between metric outputs (default: 60)

use anyhow::Result;
use stocksbot::application::system::Application;
use stocksbot::config::Config;
use stocksbot::infrastructure::observability::MetricsReporter;
use tracing::{Level, info};
use tracing_subscriber::prelude::*;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let stdout_layer = tracing_subscriber::fmt::layer().with_target(false).pretty();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .with(stdout_layer)
        .init();

    info!("StocksBot Server {} starting...", env!("CARGO_PKG_VERSION"));

    let config = Config::from_env()?;
    info!(
        "Configuration loaded: tick={}s, workers={}, queue={}, database={}",
        config.runner.tick_interval_seconds,
        config.scheduler.max_workers,
        config.scheduler.queue_capacity,
        config.database_url
    );

    let app = Application::build(config.clone()).await?;
    app.start().await?;
    info!("Trading system running.");

    if config.observability.enabled {
        let reporter = MetricsReporter::new(
            app.runner.clone(),
            app.scheduler.clone(),
            app.safety.clone(),
            app.metrics.clone(),
            config.observability.interval_seconds,
        );
        tokio::spawn(async move {
            reporter.run().await;
        });
        info!(
            "Metrics reporter started (interval: {}s)",
            config.observability.interval_seconds
        );
    } else {
        info!("Metrics reporting disabled.");
    }

    info!("Server running. Press Ctrl+C to shutdown.");
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received.");

    let summary = app.shutdown_service().shutdown().await;
    info!(
        "Shutdown complete: runner_stopped={} jobs_canceled={} jobs_drained={}",
        summary.runner_stopped, summary.jobs_canceled, summary.jobs_drained
    );

    Ok(())
}
