use thiserror::Error;

/// Errors surfaced by the live strategy runner
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("No active strategies to run")]
    NoStrategiesLoaded,

    #[error("Runner is in ERROR state; stop it before starting again")]
    RequiresReset,

    #[error("Persisted runner state is corrupted: {reason}")]
    CorruptedState { reason: String },

    #[error("Strategy {strategy_id} faulted: {reason}")]
    StrategyFault { strategy_id: String, reason: String },
}

/// Errors surfaced by the optimization job scheduler
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Optimization queue is saturated ({active} active jobs, capacity {capacity})")]
    QueueSaturated { active: usize, capacity: usize },

    #[error("Optimization job not found: {job_id}")]
    JobNotFound { job_id: String },

    #[error("Invalid optimization request: {reason}")]
    InvalidRequest { reason: String },

    #[error("Job history persistence failed: {0}")]
    Persistence(#[from] anyhow::Error),
}

/// Lifecycle violations on an optimization job
#[derive(Debug, Error, PartialEq, Eq)]
pub enum JobTransitionError {
    #[error("Job {job_id} is already terminal ({status})")]
    AlreadyTerminal { job_id: String, status: String },

    #[error("Job {job_id} cannot move from {from} to {to}")]
    IllegalTransition {
        job_id: String,
        from: String,
        to: String,
    },
}

/// Errors raised by the backtest simulator
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SimulationError {
    #[error("Insufficient historical data for: {}", symbols.join(", "))]
    InsufficientData { symbols: Vec<String> },

    #[error("Invalid date range: {start} is after {end}")]
    InvalidRange { start: String, end: String },

    #[error("Invalid parameters: {reason}")]
    InvalidParameters { reason: String },

    #[error("Simulation canceled")]
    Canceled,
}

/// Errors raised by the parameter search engine
#[derive(Debug, Error)]
pub enum OptimizationError {
    #[error("Optimization canceled")]
    Canceled,

    #[error("Invalid optimization request: {reason}")]
    InvalidRequest { reason: String },

    #[error(transparent)]
    Simulation(#[from] SimulationError),

    #[error("Optimization failed: {0}")]
    Internal(#[from] anyhow::Error),
}

impl OptimizationError {
    pub fn is_canceled(&self) -> bool {
        matches!(
            self,
            OptimizationError::Canceled | OptimizationError::Simulation(SimulationError::Canceled)
        )
    }
}

/// Rejections from the order submission path
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("{reason}")]
    Validation { reason: String },

    #[error("{reason}")]
    PreflightDenied { reason: String },

    #[error("Order rate limit exceeded: max {max_per_minute} orders per minute")]
    Throttled { max_per_minute: usize },

    #[error("Broker error: {0}")]
    Broker(#[source] anyhow::Error),
}

impl ExecutionError {
    pub fn validation(reason: impl Into<String>) -> Self {
        ExecutionError::Validation {
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insufficient_data_lists_symbols() {
        let err = SimulationError::InsufficientData {
            symbols: vec!["AAPL".to_string(), "MSFT".to_string()],
        };
        assert_eq!(
            err.to_string(),
            "Insufficient historical data for: AAPL, MSFT"
        );
    }

    #[test]
    fn test_canceled_simulation_counts_as_canceled_optimization() {
        let err: OptimizationError = SimulationError::Canceled.into();
        assert!(err.is_canceled());
        assert!(!OptimizationError::InvalidRequest { reason: "x".into() }.is_canceled());
    }
}
