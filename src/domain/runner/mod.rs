pub mod market_calendar;
pub mod state;

pub use state::{RunnerCommandResult, RunnerMode, RunnerState};
