mod audit_repository;
mod job_history_repository;
mod runner_state_repository;
mod strategy_repository;
mod trading_repository;

pub use audit_repository::SqliteAuditSink;
pub use job_history_repository::SqliteJobHistoryRepository;
pub use runner_state_repository::SqliteRunnerStateRepository;
pub use strategy_repository::SqliteStrategyRepository;
pub use trading_repository::{SqliteOrderRepository, SqlitePositionRepository, SqliteTradeRepository};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::str::FromStr;

pub(crate) fn decimal_column(value: &str, column: &str) -> Result<Decimal> {
    Decimal::from_str(value).with_context(|| format!("Invalid decimal in column {}", column))
}

pub(crate) fn optional_decimal_column(value: Option<String>, column: &str) -> Result<Option<Decimal>> {
    value.map(|v| decimal_column(&v, column)).transpose()
}

pub(crate) fn timestamp_column(millis: i64, column: &str) -> Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(millis)
        .with_context(|| format!("Invalid timestamp in column {}", column))
}
