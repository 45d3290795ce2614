// Order submission path shared by the runner and manual orders
pub mod order_executor;
pub mod order_throttler;

pub use order_executor::{ExecutionReport, OrderExecutor};
pub use order_throttler::OrderThrottler;
