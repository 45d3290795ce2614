pub mod job;
pub mod parameters;
pub mod request;
pub mod result;

pub use job::{CancelOutcome, JobFilter, JobStatus, JobStatusView, JobSubmission, OptimizationJob};
pub use parameters::{ParameterBound, ParameterSpace, StrategyParameters, normalize_symbols};
pub use request::{Objective, OptimizationRequest};
pub use result::{
    BacktestCandidate, CandidateMetrics, EnsembleStats, StrategyOptimizationResult,
    WalkForwardFold, WalkForwardReport,
};
