//! Single order submission path.
//!
//! The runner and manual orders both go through `OrderExecutor::submit`, so
//! validation, throttling and preflight cannot diverge between them.

use crate::application::safety::SafetyController;
use crate::application::trading::order_throttler::OrderThrottler;
use crate::domain::errors::ExecutionError;
use crate::domain::ports::{AuditSink, BrokerClient, MarketDataProvider};
use crate::domain::repositories::{OrderRepository, PositionRepository, TradeRepository};
use crate::domain::trading::types::{
    Order, OrderRequest, OrderSide, OrderType, Position, Trade,
};
use crate::infrastructure::observability::Metrics;
use chrono::{NaiveDate, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::json;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

/// Floor for the equity-based position cap
const MIN_POSITION_CAP: Decimal = dec!(100);
/// Largest share of equity a single position may take
const MAX_EQUITY_SHARE: Decimal = dec!(0.25);

/// Realized losses booked on the current UTC day
#[derive(Debug, Default)]
struct DailyLoss {
    day: Option<NaiveDate>,
    loss: Decimal,
}

impl DailyLoss {
    fn roll(&mut self, today: NaiveDate) {
        if self.day != Some(today) {
            self.day = Some(today);
            self.loss = Decimal::ZERO;
        }
    }
}

/// What a successful submission produced
#[derive(Debug, Clone)]
pub struct ExecutionReport {
    pub order: Order,
    pub trade: Option<Trade>,
}

pub struct OrderExecutor {
    broker: Arc<dyn BrokerClient>,
    market_data: Arc<dyn MarketDataProvider>,
    safety: Arc<SafetyController>,
    orders: Arc<dyn OrderRepository>,
    trades: Arc<dyn TradeRepository>,
    positions: Arc<dyn PositionRepository>,
    audit: Arc<dyn AuditSink>,
    throttler: OrderThrottler,
    daily_loss: Mutex<DailyLoss>,
    metrics: Option<Metrics>,
}

impl OrderExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        broker: Arc<dyn BrokerClient>,
        market_data: Arc<dyn MarketDataProvider>,
        safety: Arc<SafetyController>,
        orders: Arc<dyn OrderRepository>,
        trades: Arc<dyn TradeRepository>,
        positions: Arc<dyn PositionRepository>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        let throttler = OrderThrottler::new(safety.config().max_orders_per_minute);
        Self {
            broker,
            market_data,
            safety,
            orders,
            trades,
            positions,
            audit,
            throttler,
            daily_loss: Mutex::new(DailyLoss::default()),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_throttler(mut self, throttler: OrderThrottler) -> Self {
        self.throttler = throttler;
        self
    }

    pub fn safety(&self) -> &Arc<SafetyController> {
        &self.safety
    }

    /// Validate, gate and submit one order, then persist what the broker did
    pub async fn submit(&self, request: OrderRequest) -> Result<ExecutionReport, ExecutionError> {
        let mut request = request;
        request.symbol = request.symbol.trim().to_uppercase();

        if let Err(e) = self.check(&request).await {
            warn!(
                "OrderExecutor: rejected {} {} {}: {}",
                request.side, request.quantity, request.symbol, e
            );
            if let Some(metrics) = &self.metrics {
                metrics.inc_orders(&side_label(request.side), "rejected");
            }
            return Err(e);
        }

        let result = self
            .broker
            .submit_order(&request)
            .await
            .map_err(ExecutionError::Broker)?;
        let order = Order::from_request(&request, &result);
        info!(
            "OrderExecutor: {} {} {} -> {} ({})",
            order.side, order.quantity, order.symbol, order.status, result.order_id
        );
        if let Some(metrics) = &self.metrics {
            metrics.inc_orders(
                &side_label(order.side),
                &order.status.to_string().to_lowercase(),
            );
        }

        if let Err(e) = self.orders.save_order(&order).await {
            warn!("OrderExecutor: failed to persist order {}: {}", order.id, e);
        }
        self.record(
            "order_created",
            &format!("{} {} {}", order.side, order.quantity, order.symbol),
            json!({
                "order_id": order.id,
                "broker_order_id": order.broker_order_id,
                "status": order.status.to_string(),
                "strategy_id": order.strategy_id,
            }),
        )
        .await;

        let trade = match result.filled_avg_price {
            Some(price) if !result.filled_quantity.is_zero() => {
                Some(self.record_fill(&order, result.filled_quantity, price).await)
            }
            _ => None,
        };

        Ok(ExecutionReport { order, trade })
    }

    async fn check(&self, request: &OrderRequest) -> Result<(), ExecutionError> {
        if request.symbol.is_empty() {
            return Err(ExecutionError::validation("Symbol is required"));
        }
        if request.quantity <= Decimal::ZERO {
            return Err(ExecutionError::validation(format!(
                "Quantity must be positive, got {}",
                request.quantity
            )));
        }
        if request.order_type == OrderType::Limit
            && !request.limit_price.is_some_and(|p| p > Decimal::ZERO)
        {
            return Err(ExecutionError::validation(
                "Limit orders require a positive limit price",
            ));
        }

        if !self.throttler.try_acquire() {
            return Err(ExecutionError::Throttled {
                max_per_minute: self.throttler.max_orders(),
            });
        }

        let decision = self.safety.preflight(&request.symbol).await;
        if !decision.allowed {
            return Err(ExecutionError::PreflightDenied {
                reason: decision.reason,
            });
        }

        if request.side == OrderSide::Buy {
            self.check_buy_limits(request).await?;
        }
        Ok(())
    }

    async fn check_buy_limits(&self, request: &OrderRequest) -> Result<(), ExecutionError> {
        let price = match (request.order_type, request.limit_price) {
            (OrderType::Limit, Some(price)) => price,
            _ => {
                self.market_data
                    .latest_quote(&request.symbol)
                    .await
                    .map_err(ExecutionError::Broker)?
                    .price
            }
        };
        let notional = price * request.quantity;

        let account = self
            .broker
            .get_account()
            .await
            .map_err(ExecutionError::Broker)?;
        if notional > account.buying_power {
            return Err(ExecutionError::validation(format!(
                "Insufficient buying power: order needs {:.2}, available {:.2}",
                notional, account.buying_power
            )));
        }

        let held = self
            .broker
            .get_positions()
            .await
            .map_err(ExecutionError::Broker)?
            .into_iter()
            .find(|p| p.symbol == request.symbol)
            .map(|p| p.quantity * price)
            .unwrap_or(Decimal::ZERO);
        let booked = self.loss_today();
        let risk_limit = self
            .safety
            .config()
            .effective_daily_risk_limit(account.equity);
        if booked >= risk_limit {
            return Err(ExecutionError::validation(format!(
                "Daily risk limit reached: realized loss {:.2} today, limit {:.2}",
                booked, risk_limit
            )));
        }

        let cap = self
            .safety
            .config()
            .max_position_size
            .min(MIN_POSITION_CAP.max(account.equity * MAX_EQUITY_SHARE));
        if held + notional > cap {
            return Err(ExecutionError::validation(format!(
                "Position size {:.2} for {} exceeds limit {:.2}",
                held + notional,
                request.symbol,
                cap
            )));
        }
        Ok(())
    }

    async fn record_fill(&self, order: &Order, quantity: Decimal, price: Decimal) -> Trade {
        let mut trade = Trade::from_fill(order, quantity, price);
        if order.side == OrderSide::Sell {
            trade.realized_pnl = self.realized_pnl(&order.symbol, quantity, price).await;
            if let Some(pnl) = trade.realized_pnl.filter(|p| p.is_sign_negative()) {
                self.book_loss(-pnl);
            }
        }
        if let Err(e) = self.trades.save_trade(&trade).await {
            warn!("OrderExecutor: failed to persist trade {}: {}", trade.id, e);
        }
        self.sync_position(&order.symbol).await;
        self.record(
            "order_filled",
            &format!("{} {} {} @ {}", order.side, quantity, order.symbol, price),
            json!({
                "order_id": order.id,
                "trade_id": trade.id,
                "quantity": quantity.to_string(),
                "price": price.to_string(),
            }),
        )
        .await;
        trade
    }

    /// P&L of a sell against the stored cost basis, read before the
    /// position is refreshed
    async fn realized_pnl(&self, symbol: &str, quantity: Decimal, price: Decimal) -> Option<Decimal> {
        match self.positions.get_position(symbol).await {
            Ok(Some(held)) if held.quantity > Decimal::ZERO => {
                Some((price - held.average_price) * quantity.min(held.quantity))
            }
            Ok(_) => None,
            Err(e) => {
                warn!("OrderExecutor: cost basis of {} unavailable: {}", symbol, e);
                None
            }
        }
    }

    fn book_loss(&self, loss: Decimal) {
        let mut daily = self.daily_loss.lock().unwrap_or_else(|e| e.into_inner());
        daily.roll(Utc::now().date_naive());
        daily.loss += loss;
        info!("OrderExecutor: realized loss today {:.2}", daily.loss);
    }

    fn loss_today(&self) -> Decimal {
        let mut daily = self.daily_loss.lock().unwrap_or_else(|e| e.into_inner());
        daily.roll(Utc::now().date_naive());
        daily.loss
    }

    /// Mirror the broker's view of one position into storage
    async fn sync_position(&self, symbol: &str) {
        let position: Option<Position> = match self.broker.get_positions().await {
            Ok(positions) => positions.into_iter().find(|p| p.symbol == symbol),
            Err(e) => {
                warn!("OrderExecutor: cannot refresh position {}: {}", symbol, e);
                return;
            }
        };
        let outcome = match position {
            Some(position) => self.positions.upsert_position(&position).await,
            None => self.positions.delete_position(symbol).await,
        };
        if let Err(e) = outcome {
            warn!("OrderExecutor: failed to persist position {}: {}", symbol, e);
        }
    }

    async fn record(&self, event_type: &str, description: &str, details: serde_json::Value) {
        if let Err(e) = self.audit.record(event_type, description, details).await {
            warn!("OrderExecutor: audit write for {} failed: {}", event_type, e);
        }
    }
}

fn side_label(side: OrderSide) -> String {
    side.to_string().to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SafetyEnvConfig;
    use crate::infrastructure::mock::{PaperBroker, SyntheticMarketData};
    use crate::infrastructure::repositories::{
        InMemoryAuditSink, InMemoryOrderRepository, InMemoryPositionRepository,
        InMemoryTradeRepository,
    };
    use crate::domain::trading::types::OrderStatus;
    use std::time::Duration;

    struct Harness {
        executor: OrderExecutor,
        data: Arc<SyntheticMarketData>,
        safety: Arc<SafetyController>,
        positions: Arc<InMemoryPositionRepository>,
        trades: Arc<InMemoryTradeRepository>,
        audit: Arc<InMemoryAuditSink>,
    }

    async fn harness(cash: Decimal) -> Harness {
        let data = SyntheticMarketData::default();
        data.set_price("AAPL", dec!(100)).await;
        let data = Arc::new(data);
        let broker = Arc::new(PaperBroker::new(data.clone(), cash));
        let audit = Arc::new(InMemoryAuditSink::default());
        let safety = Arc::new(SafetyController::new(
            broker.clone(),
            audit.clone(),
            SafetyEnvConfig::default(),
        ));
        let positions = Arc::new(InMemoryPositionRepository::default());
        let trades = Arc::new(InMemoryTradeRepository::default());
        let executor = OrderExecutor::new(
            broker,
            data.clone(),
            safety.clone(),
            Arc::new(InMemoryOrderRepository::default()),
            trades.clone(),
            positions.clone(),
            audit.clone(),
        );
        Harness {
            executor,
            data,
            safety,
            positions,
            trades,
            audit,
        }
    }

    #[tokio::test]
    async fn test_filled_buy_records_trade_and_position() {
        let h = harness(dec!(100000)).await;
        let report = h
            .executor
            .submit(OrderRequest::market("aapl", OrderSide::Buy, dec!(10)))
            .await
            .unwrap();

        assert_eq!(report.order.status, OrderStatus::Filled);
        assert_eq!(report.order.symbol, "AAPL");
        assert!(report.trade.is_some());
        assert_eq!(h.trades.count_trades().await.unwrap(), 1);
        let position = h.positions.get_position("AAPL").await.unwrap().unwrap();
        assert_eq!(position.quantity, dec!(10));
        assert_eq!(h.audit.count("order_created").await, 1);
        assert_eq!(h.audit.count("order_filled").await, 1);
    }

    #[tokio::test]
    async fn test_validation_rejects_before_preflight() {
        let h = harness(dec!(100000)).await;
        h.safety.set_kill_switch(true).await;

        let err = h
            .executor
            .submit(OrderRequest::market("AAPL", OrderSide::Buy, dec!(0)))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::Validation { .. }));

        let mut limit = OrderRequest::limit("AAPL", OrderSide::Buy, dec!(1), dec!(1));
        limit.limit_price = None;
        let err = h.executor.submit(limit).await.unwrap_err();
        assert!(err.to_string().contains("limit price"));

        let err = h
            .executor
            .submit(OrderRequest::market("AAPL", OrderSide::Buy, dec!(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::PreflightDenied { .. }));
    }

    #[tokio::test]
    async fn test_position_cap_uses_equity_share() {
        // equity 10_000 -> cap min(10_000, 2_500)
        let h = harness(dec!(10000)).await;
        let err = h
            .executor
            .submit(OrderRequest::market("AAPL", OrderSide::Buy, dec!(30)))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("exceeds limit"));

        assert!(
            h.executor
                .submit(OrderRequest::market("AAPL", OrderSide::Buy, dec!(20)))
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn test_buying_power_checked() {
        let h = harness(dec!(50)).await;
        let err = h
            .executor
            .submit(OrderRequest::market("AAPL", OrderSide::Buy, dec!(1)))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Insufficient buying power"));
    }

    #[tokio::test]
    async fn test_throttle_rejects_burst() {
        let h = harness(dec!(100000)).await;
        let executor = h
            .executor
            .with_throttler(OrderThrottler::with_window(1, Duration::from_secs(60)));
        executor
            .submit(OrderRequest::limit("AAPL", OrderSide::Buy, dec!(1), dec!(90)))
            .await
            .unwrap();
        let err = executor
            .submit(OrderRequest::limit("AAPL", OrderSide::Buy, dec!(1), dec!(90)))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::Throttled { max_per_minute: 1 }));
    }

    #[tokio::test]
    async fn test_daily_risk_limit_blocks_buys_after_losses() {
        let h = harness(dec!(100000)).await;
        h.executor
            .submit(OrderRequest::market("AAPL", OrderSide::Buy, dec!(10)))
            .await
            .unwrap();

        h.data.set_price("AAPL", dec!(40)).await;
        let sold = h
            .executor
            .submit(OrderRequest::market("AAPL", OrderSide::Sell, dec!(10)))
            .await
            .unwrap();
        let trade = sold.trade.unwrap();
        assert_eq!(trade.realized_pnl, Some(dec!(-600)));

        // Equity is about 99_400, so the limit stays at the configured 500
        let err = h
            .executor
            .submit(OrderRequest::market("AAPL", OrderSide::Buy, dec!(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::Validation { .. }));
        assert!(err.to_string().contains("Daily risk limit reached"));
    }

    #[tokio::test]
    async fn test_winning_sell_leaves_buys_open() {
        let h = harness(dec!(100000)).await;
        h.executor
            .submit(OrderRequest::market("AAPL", OrderSide::Buy, dec!(5)))
            .await
            .unwrap();
        h.data.set_price("AAPL", dec!(120)).await;
        let sold = h
            .executor
            .submit(OrderRequest::market("AAPL", OrderSide::Sell, dec!(5)))
            .await
            .unwrap();
        assert_eq!(sold.trade.unwrap().realized_pnl, Some(dec!(100)));
        assert!(
            h.executor
                .submit(OrderRequest::market("AAPL", OrderSide::Buy, dec!(1)))
                .await
                .is_ok()
        );
    }
}
