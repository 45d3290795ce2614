pub mod database;
pub mod repositories;

pub use database::Database;
pub use repositories::{
    SqliteAuditSink, SqliteJobHistoryRepository, SqliteOrderRepository, SqlitePositionRepository,
    SqliteRunnerStateRepository, SqliteStrategyRepository, SqliteTradeRepository,
};
