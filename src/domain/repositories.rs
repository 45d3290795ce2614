//! Repository Pattern Abstractions
//!
//! The persistence gateway is split by concern. Every trait has a SQLite
//! implementation under `infrastructure::persistence` and an in-memory
//! implementation under `infrastructure::repositories` built on
//! `Arc<RwLock>`.
//!
//! Writes exist for restart continuity and operator history only; nothing
//! here coordinates between processes.

use crate::domain::optimization::job::{JobFilter, OptimizationJob};
use crate::domain::runner::state::RunnerState;
use crate::domain::strategy::StrategyRecord;
use crate::domain::trading::types::{Order, Position, Trade};
use anyhow::Result;
use async_trait::async_trait;

/// Singleton runner checkpoint
#[async_trait]
pub trait RunnerStateRepository: Send + Sync {
    async fn save_runner_state(&self, state: &RunnerState) -> Result<()>;

    /// `Err` means the stored record exists but cannot be decoded
    async fn load_runner_state(&self) -> Result<Option<RunnerState>>;
}

/// Durable optimization job history
#[async_trait]
pub trait JobHistoryRepository: Send + Sync {
    /// Insert or replace the row for `job.job_id`.
    ///
    /// A terminal row is never replaced, and a stored `cancel_requested`
    /// flag is never cleared.
    async fn append_job_history(&self, job: &OptimizationJob) -> Result<()>;

    async fn get_job(&self, job_id: &str) -> Result<Option<OptimizationJob>>;

    /// Set `cancel_requested` on a non-terminal row. `false` when no such row exists.
    async fn request_cancel(&self, job_id: &str) -> Result<bool>;

    /// Newest first
    async fn query_job_history(&self, filter: &JobFilter) -> Result<Vec<OptimizationJob>>;

    /// Delete terminal rows matching the filter. Non-terminal rows are never deleted.
    async fn purge_terminal(&self, filter: &JobFilter) -> Result<u64>;
}

#[async_trait]
pub trait OrderRepository: Send + Sync {
    async fn save_order(&self, order: &Order) -> Result<()>;
    async fn get_order(&self, id: &str) -> Result<Option<Order>>;
    async fn find_recent_orders(&self, limit: usize) -> Result<Vec<Order>>;
}

#[async_trait]
pub trait TradeRepository: Send + Sync {
    async fn save_trade(&self, trade: &Trade) -> Result<()>;
    async fn find_trades_by_symbol(&self, symbol: &str) -> Result<Vec<Trade>>;
    async fn count_trades(&self) -> Result<usize>;
}

#[async_trait]
pub trait PositionRepository: Send + Sync {
    async fn upsert_position(&self, position: &Position) -> Result<()>;
    async fn get_position(&self, symbol: &str) -> Result<Option<Position>>;
    async fn list_positions(&self) -> Result<Vec<Position>>;
    async fn delete_position(&self, symbol: &str) -> Result<()>;
}

#[async_trait]
pub trait StrategyRepository: Send + Sync {
    async fn save_strategy(&self, strategy: &StrategyRecord) -> Result<()>;
    async fn get_strategy(&self, id: &str) -> Result<Option<StrategyRecord>>;
    async fn list_active_strategies(&self) -> Result<Vec<StrategyRecord>>;
    async fn delete_strategy(&self, id: &str) -> Result<()>;
}
