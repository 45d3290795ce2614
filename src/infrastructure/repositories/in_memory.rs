//! In-Memory Repository Implementations
//!
//! Thread-safe implementations of the repository traits defined in
//! `domain::repositories`, built on `Arc<RwLock>`. Used by tests and by the
//! CLI when no database is configured. Data is lost on restart.

use crate::domain::optimization::job::{JobFilter, OptimizationJob};
use crate::domain::ports::AuditSink;
use crate::domain::repositories::{
    JobHistoryRepository, OrderRepository, PositionRepository, RunnerStateRepository,
    StrategyRepository, TradeRepository,
};
use crate::domain::runner::state::RunnerState;
use crate::domain::strategy::StrategyRecord;
use crate::domain::trading::types::{Order, Position, Trade};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Holds the single runner checkpoint
#[derive(Default)]
pub struct InMemoryRunnerStateRepository {
    state: Arc<RwLock<Option<RunnerState>>>,
}

impl InMemoryRunnerStateRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a checkpoint, as if written by a previous process
    pub fn with_state(state: RunnerState) -> Self {
        Self {
            state: Arc::new(RwLock::new(Some(state))),
        }
    }
}

#[async_trait]
impl RunnerStateRepository for InMemoryRunnerStateRepository {
    async fn save_runner_state(&self, state: &RunnerState) -> Result<()> {
        *self.state.write().await = Some(state.clone());
        Ok(())
    }

    async fn load_runner_state(&self) -> Result<Option<RunnerState>> {
        Ok(self.state.read().await.clone())
    }
}

#[derive(Default)]
pub struct InMemoryJobHistoryRepository {
    jobs: Arc<RwLock<HashMap<String, OptimizationJob>>>,
}

impl InMemoryJobHistoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.read().await.is_empty()
    }
}

#[async_trait]
impl JobHistoryRepository for InMemoryJobHistoryRepository {
    async fn append_job_history(&self, job: &OptimizationJob) -> Result<()> {
        let mut jobs = self.jobs.write().await;
        let mut job = job.clone();
        if let Some(stored) = jobs.get(&job.job_id) {
            if stored.is_terminal() {
                return Ok(());
            }
            job.cancel_requested |= stored.cancel_requested;
        }
        jobs.insert(job.job_id.clone(), job);
        Ok(())
    }

    async fn get_job(&self, job_id: &str) -> Result<Option<OptimizationJob>> {
        Ok(self.jobs.read().await.get(job_id).cloned())
    }

    async fn request_cancel(&self, job_id: &str) -> Result<bool> {
        let mut jobs = self.jobs.write().await;
        match jobs.get_mut(job_id) {
            Some(job) if !job.is_terminal() => {
                job.cancel_requested = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn query_job_history(&self, filter: &JobFilter) -> Result<Vec<OptimizationJob>> {
        let jobs = self.jobs.read().await;
        let mut matching: Vec<OptimizationJob> =
            jobs.values().filter(|j| filter.matches(j)).cloned().collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if let Some(limit) = filter.limit {
            matching.truncate(limit);
        }
        Ok(matching)
    }

    async fn purge_terminal(&self, filter: &JobFilter) -> Result<u64> {
        let mut jobs = self.jobs.write().await;
        let before = jobs.len();
        jobs.retain(|_, job| !(job.is_terminal() && filter.matches(job)));
        Ok((before - jobs.len()) as u64)
    }
}

#[derive(Default)]
pub struct InMemoryOrderRepository {
    orders: Arc<RwLock<Vec<Order>>>,
}

impl InMemoryOrderRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OrderRepository for InMemoryOrderRepository {
    async fn save_order(&self, order: &Order) -> Result<()> {
        let mut orders = self.orders.write().await;
        match orders.iter_mut().find(|o| o.id == order.id) {
            Some(existing) => *existing = order.clone(),
            None => orders.push(order.clone()),
        }
        Ok(())
    }

    async fn get_order(&self, id: &str) -> Result<Option<Order>> {
        Ok(self
            .orders
            .read()
            .await
            .iter()
            .find(|o| o.id == id)
            .cloned())
    }

    async fn find_recent_orders(&self, limit: usize) -> Result<Vec<Order>> {
        let orders = self.orders.read().await;
        Ok(orders.iter().rev().take(limit).cloned().collect())
    }
}

/// In-memory implementation of TradeRepository
#[derive(Default)]
pub struct InMemoryTradeRepository {
    trades: Arc<RwLock<Vec<Trade>>>,
}

impl InMemoryTradeRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TradeRepository for InMemoryTradeRepository {
    async fn save_trade(&self, trade: &Trade) -> Result<()> {
        self.trades.write().await.push(trade.clone());
        Ok(())
    }

    async fn find_trades_by_symbol(&self, symbol: &str) -> Result<Vec<Trade>> {
        let trades = self.trades.read().await;
        Ok(trades
            .iter()
            .filter(|t| t.symbol == symbol)
            .cloned()
            .collect())
    }

    async fn count_trades(&self) -> Result<usize> {
        Ok(self.trades.read().await.len())
    }
}

#[derive(Default)]
pub struct InMemoryPositionRepository {
    positions: Arc<RwLock<HashMap<String, Position>>>,
}

impl InMemoryPositionRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PositionRepository for InMemoryPositionRepository {
    async fn upsert_position(&self, position: &Position) -> Result<()> {
        self.positions
            .write()
            .await
            .insert(position.symbol.clone(), position.clone());
        Ok(())
    }

    async fn get_position(&self, symbol: &str) -> Result<Option<Position>> {
        Ok(self.positions.read().await.get(symbol).cloned())
    }

    async fn list_positions(&self) -> Result<Vec<Position>> {
        let positions = self.positions.read().await;
        let mut all: Vec<Position> = positions.values().cloned().collect();
        all.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        Ok(all)
    }

    async fn delete_position(&self, symbol: &str) -> Result<()> {
        self.positions.write().await.remove(symbol);
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryStrategyRepository {
    strategies: Arc<RwLock<HashMap<String, StrategyRecord>>>,
}

impl InMemoryStrategyRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StrategyRepository for InMemoryStrategyRepository {
    async fn save_strategy(&self, strategy: &StrategyRecord) -> Result<()> {
        self.strategies
            .write()
            .await
            .insert(strategy.id.clone(), strategy.clone());
        Ok(())
    }

    async fn get_strategy(&self, id: &str) -> Result<Option<StrategyRecord>> {
        Ok(self.strategies.read().await.get(id).cloned())
    }

    async fn list_active_strategies(&self) -> Result<Vec<StrategyRecord>> {
        let strategies = self.strategies.read().await;
        let mut active: Vec<StrategyRecord> =
            strategies.values().filter(|s| s.active).cloned().collect();
        active.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(active)
    }

    async fn delete_strategy(&self, id: &str) -> Result<()> {
        self.strategies.write().await.remove(id);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AuditRecord {
    pub event_type: String,
    pub description: String,
    pub details: serde_json::Value,
    pub recorded_at: DateTime<Utc>,
}

/// Keeps audit events in memory so tests can assert on them
#[derive(Default)]
pub struct InMemoryAuditSink {
    events: Arc<RwLock<Vec<AuditRecord>>>,
}

impl InMemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn events(&self) -> Vec<AuditRecord> {
        self.events.read().await.clone()
    }

    pub async fn count(&self, event_type: &str) -> usize {
        self.events
            .read()
            .await
            .iter()
            .filter(|e| e.event_type == event_type)
            .count()
    }
}

#[async_trait]
impl AuditSink for InMemoryAuditSink {
    async fn record(
        &self,
        event_type: &str,
        description: &str,
        details: serde_json::Value,
    ) -> Result<()> {
        self.events.write().await.push(AuditRecord {
            event_type: event_type.to_string(),
            description: description.to_string(),
            details,
            recorded_at: Utc::now(),
        });
        Ok(())
    }
}
