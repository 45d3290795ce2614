// Live strategy scheduling loop
pub mod reconciliation;
pub mod strategy_runner;

pub use reconciliation::{PositionDrift, reconcile_positions};
pub use strategy_runner::{RunnerRepositories, RunnerStartOptions, StrategyRunner};
