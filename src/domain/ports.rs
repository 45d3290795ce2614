use crate::domain::trading::types::{
    Account, Candle, OrderRequest, OrderResult, Position, Quote,
};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};

/// Brokerage capability consumed by the runner, the order executor and panic-stop.
#[async_trait]
pub trait BrokerClient: Send + Sync {
    async fn connect(&self) -> Result<()>;
    async fn disconnect(&self) -> Result<()>;
    async fn is_connected(&self) -> bool;
    async fn is_market_open(&self) -> Result<bool>;

    /// Next regular session open, when the broker publishes a clock.
    async fn next_market_open(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(None)
    }

    async fn is_symbol_tradable(&self, _symbol: &str) -> Result<bool> {
        Ok(true)
    }

    async fn get_account(&self) -> Result<Account>;
    async fn get_positions(&self) -> Result<Vec<Position>>;
    async fn submit_order(&self, request: &OrderRequest) -> Result<OrderResult>;
    async fn cancel_order(&self, order_id: &str) -> Result<()>;
    async fn get_order_status(&self, order_id: &str) -> Result<OrderResult>;
}

#[async_trait]
pub trait MarketDataProvider: Send + Sync {
    async fn latest_quote(&self, symbol: &str) -> Result<Quote>;

    /// Daily bars with session dates in `[start, end]`, oldest first.
    async fn historical_bars(
        &self,
        symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<Candle>>;
}

#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(
        &self,
        event_type: &str,
        description: &str,
        details: serde_json::Value,
    ) -> Result<()>;
}
