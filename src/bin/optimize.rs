//! Optimization Job CLI
//!
//! Submits parameter searches and manages the persisted job history.
//! Results are printed to stdout as JSON; logs go to stderr.

use anyhow::{Context, Result};
use chrono::{Duration, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use std::sync::Arc;
use stocksbot::application::bootstrap::PersistenceBootstrap;
use stocksbot::application::optimization::scheduler::OptimizationJobScheduler;
use stocksbot::application::optimization::search::ParameterSearchEngine;
use stocksbot::application::system::SYNTHETIC_DATA_SEED;
use stocksbot::config::Config;
use stocksbot::domain::backtest::{CapitalSchedule, DateRange};
use stocksbot::domain::optimization::job::{JobFilter, JobStatus};
use stocksbot::domain::optimization::request::{Objective, OptimizationRequest};
use stocksbot::infrastructure::mock::SyntheticMarketData;
use tracing::{Level, info, warn};

/// Poll period while waiting on a submitted job
const POLL_INTERVAL_MS: u64 = 500;

#[derive(Parser)]
#[command(author, version, about = "Optimization job scheduler CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit one optimization job and wait for its result
    Run {
        /// Strategy the job belongs to
        #[arg(long, default_value = "cli")]
        strategy_id: String,

        /// Comma-separated list of symbols
        #[arg(short, long, default_value = "AAPL,MSFT,NVDA")]
        symbols: String,

        /// Start date (YYYY-MM-DD)
        #[arg(long, default_value = "2022-01-01")]
        start: String,

        /// End date (YYYY-MM-DD)
        #[arg(long, default_value = "2023-12-31")]
        end: String,

        /// Candidates to evaluate
        #[arg(short, long, default_value = "24")]
        iterations: usize,

        /// Ranking objective (balanced, sharpe, return)
        #[arg(long, default_value = "balanced")]
        objective: String,

        /// Trade count below which candidates are penalized
        #[arg(long, default_value = "5")]
        min_trades: usize,

        /// Drop candidates below the trade target instead of penalizing them
        #[arg(long)]
        strict: bool,

        /// Score each candidate over perturbed scenarios
        #[arg(long)]
        ensemble: bool,

        /// Scenarios per candidate in ensemble mode
        #[arg(long, default_value = "8")]
        ensemble_runs: usize,

        /// Validate the winner out-of-sample
        #[arg(long)]
        walk_forward: bool,

        /// Walk-forward folds
        #[arg(long, default_value = "4")]
        folds: usize,

        /// Seed for candidate sampling
        #[arg(long)]
        seed: Option<u64>,

        /// Starting capital of every backtest
        #[arg(long, default_value = "10000")]
        initial_capital: Decimal,
    },
    /// List jobs that are queued or running
    ListActive,
    /// Cancel one job
    CancelJob {
        #[arg(long)]
        job_id: String,

        /// Mark the job canceled without waiting for the worker
        #[arg(long)]
        force: bool,
    },
    /// Cancel every queued or running job
    CancelAll {
        #[arg(long)]
        force: bool,
    },
    /// Delete terminal jobs from history
    Purge {
        /// Comma-separated statuses (default: all terminal statuses)
        #[arg(long)]
        status: Option<String>,

        #[arg(long)]
        strategy: Option<String>,

        /// Only jobs created more than this many days ago
        #[arg(long)]
        older_than_days: Option<i64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber).ok();

    let cli = Cli::parse();
    let config = Config::from_env()?;
    let persistence = PersistenceBootstrap::init(&config.database_url).await?;
    let market_data = Arc::new(SyntheticMarketData::new(SYNTHETIC_DATA_SEED));
    let scheduler = OptimizationJobScheduler::new(
        Arc::new(ParameterSearchEngine::new(market_data)),
        persistence.job_history_repository.clone(),
        config.scheduler.clone(),
    );

    match cli.command {
        Commands::Run {
            strategy_id,
            symbols,
            start,
            end,
            iterations,
            objective,
            min_trades,
            strict,
            ensemble,
            ensemble_runs,
            walk_forward,
            folds,
            seed,
            initial_capital,
        } => {
            let symbols: Vec<String> = symbols
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
            let mut request = OptimizationRequest::new(symbols, parse_date_range(&start, &end)?);
            request.iterations = iterations;
            request.objective = objective.parse::<Objective>()?;
            request.min_trades = min_trades;
            request.strict_min_trades = strict;
            request.ensemble_mode = ensemble;
            request.ensemble_runs = ensemble_runs;
            request.walk_forward_enabled = walk_forward;
            request.walk_forward_folds = folds;
            request.random_seed = seed;
            request.capital = CapitalSchedule::lump_sum(initial_capital);

            let submission = scheduler.submit(&strategy_id, request).await?;
            info!("Submitted job {}", submission.job_id);

            let job_id = submission.job_id;
            let mut poll = tokio::time::interval(std::time::Duration::from_millis(POLL_INTERVAL_MS));
            let view = loop {
                tokio::select! {
                    _ = poll.tick() => {
                        let view = scheduler.get_status(&job_id).await?;
                        if view.job.is_terminal() {
                            break view;
                        }
                        info!(
                            "Job {} {} {:.0}% ({})",
                            job_id, view.job.status, view.job.progress_pct, view.job.stage
                        );
                    }
                    _ = tokio::signal::ctrl_c() => {
                        warn!("Interrupted; canceling job {}", job_id);
                        scheduler.cancel(&job_id, true).await?;
                    }
                }
            };

            match view.job.result.as_deref() {
                Some(result) if view.job.status == JobStatus::Completed => {
                    println!("{}", serde_json::to_string_pretty(result)?);
                }
                _ => {
                    println!("{}", serde_json::to_string_pretty(&view)?);
                    anyhow::bail!(
                        "Job {} ended {}: {}",
                        job_id,
                        view.job.status,
                        view.job.error.as_deref().unwrap_or("no result")
                    );
                }
            }
        }
        Commands::ListActive => {
            let jobs = scheduler
                .history(&JobFilter::with_statuses(&[JobStatus::Queued, JobStatus::Running]))
                .await?;
            let mut views = Vec::with_capacity(jobs.len());
            for job in jobs {
                views.push(scheduler.get_status(&job.job_id).await?);
            }
            println!("{}", serde_json::to_string_pretty(&views)?);
        }
        Commands::CancelJob { job_id, force } => {
            let outcome = scheduler.cancel(&job_id, force).await?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }
        Commands::CancelAll { force } => {
            let jobs = scheduler
                .history(&JobFilter::with_statuses(&[JobStatus::Queued, JobStatus::Running]))
                .await?;
            let mut outcomes = Vec::with_capacity(jobs.len());
            for job in jobs {
                outcomes.push(scheduler.cancel(&job.job_id, force).await?);
            }
            println!("{}", serde_json::to_string_pretty(&outcomes)?);
        }
        Commands::Purge {
            status,
            strategy,
            older_than_days,
        } => {
            let statuses = match status {
                Some(list) => list
                    .split(',')
                    .map(|s| s.parse::<JobStatus>())
                    .collect::<Result<Vec<_>>>()?,
                None => JobStatus::terminal().to_vec(),
            };
            let filter = JobFilter {
                statuses,
                strategy_id: strategy,
                created_before: older_than_days.map(|days| Utc::now() - Duration::days(days)),
                limit: None,
            };
            let deleted = scheduler.purge(&filter).await?;
            println!("{}", serde_json::json!({ "deleted": deleted }));
        }
    }

    Ok(())
}

fn parse_date_range(start: &str, end: &str) -> Result<DateRange> {
    let start_date = NaiveDate::parse_from_str(start, "%Y-%m-%d")
        .with_context(|| format!("Invalid start date format: {}", start))?;
    let end_date = NaiveDate::parse_from_str(end, "%Y-%m-%d")
        .with_context(|| format!("Invalid end date format: {}", end))?;
    Ok(DateRange::new(start_date, end_date)?)
}
