use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::info;

use crate::domain::ports::AuditSink;
use crate::domain::repositories::{
    JobHistoryRepository, OrderRepository, PositionRepository, RunnerStateRepository,
    StrategyRepository, TradeRepository,
};
use crate::infrastructure::audit::TracingAuditSink;
use crate::infrastructure::persistence::Database;
use crate::infrastructure::persistence::repositories::{
    SqliteAuditSink, SqliteJobHistoryRepository, SqliteOrderRepository, SqlitePositionRepository,
    SqliteRunnerStateRepository, SqliteStrategyRepository, SqliteTradeRepository,
};
use crate::infrastructure::repositories::{
    InMemoryAuditSink, InMemoryJobHistoryRepository, InMemoryOrderRepository,
    InMemoryPositionRepository, InMemoryRunnerStateRepository, InMemoryStrategyRepository,
    InMemoryTradeRepository,
};

/// Every repository the application needs, behind its trait
#[derive(Clone)]
pub struct PersistenceHandle {
    pub db: Option<Database>,
    pub runner_state_repository: Arc<dyn RunnerStateRepository>,
    pub job_history_repository: Arc<dyn JobHistoryRepository>,
    pub order_repository: Arc<dyn OrderRepository>,
    pub trade_repository: Arc<dyn TradeRepository>,
    pub position_repository: Arc<dyn PositionRepository>,
    pub strategy_repository: Arc<dyn StrategyRepository>,
    pub audit_sink: Arc<dyn AuditSink>,
}

pub struct PersistenceBootstrap;

impl PersistenceBootstrap {
    pub async fn init(database_url: &str) -> Result<PersistenceHandle> {
        info!("Initializing Database at {}", database_url);
        let db = Database::new(database_url)
            .await
            .context("Failed to initialize database")?;

        let durable_audit: Arc<dyn AuditSink> = Arc::new(SqliteAuditSink::new(db.clone()));
        Ok(PersistenceHandle {
            runner_state_repository: Arc::new(SqliteRunnerStateRepository::new(db.clone())),
            job_history_repository: Arc::new(SqliteJobHistoryRepository::new(db.clone())),
            order_repository: Arc::new(SqliteOrderRepository::new(db.clone())),
            trade_repository: Arc::new(SqliteTradeRepository::new(db.clone())),
            position_repository: Arc::new(SqlitePositionRepository::new(db.clone())),
            strategy_repository: Arc::new(SqliteStrategyRepository::new(db.clone())),
            audit_sink: Arc::new(TracingAuditSink::wrapping(durable_audit)),
            db: Some(db),
        })
    }

    /// Process-local storage; nothing survives a restart
    pub fn in_memory() -> PersistenceHandle {
        let audit: Arc<dyn AuditSink> = Arc::new(InMemoryAuditSink::default());
        PersistenceHandle {
            db: None,
            runner_state_repository: Arc::new(InMemoryRunnerStateRepository::default()),
            job_history_repository: Arc::new(InMemoryJobHistoryRepository::default()),
            order_repository: Arc::new(InMemoryOrderRepository::default()),
            trade_repository: Arc::new(InMemoryTradeRepository::default()),
            position_repository: Arc::new(InMemoryPositionRepository::default()),
            strategy_repository: Arc::new(InMemoryStrategyRepository::default()),
            audit_sink: Arc::new(TracingAuditSink::wrapping(audit)),
        }
    }
}
