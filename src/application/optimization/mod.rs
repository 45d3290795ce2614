// Backtesting, parameter search and the job scheduler that runs it
pub mod objective;
pub mod scheduler;
pub mod search;
pub mod simulator;
pub mod walk_forward;
