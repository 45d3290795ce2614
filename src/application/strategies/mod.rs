mod buy_and_hold;
pub mod moving_average_crossover;
pub mod strategy_factory;
mod traits;

pub use buy_and_hold::BuyAndHold;
pub use moving_average_crossover::MovingAverageCrossover;
pub use strategy_factory::StrategyFactory;
pub use traits::{LiveStrategy, Signal, SignalKind};
