//! Position liquidation with retry.
//!
//! Each position is closed on its own; one failure never stops the others.

use crate::domain::ports::BrokerClient;
use crate::domain::safety::LiquidationOutcome;
use crate::domain::trading::types::{OrderRequest, OrderStatus, Position};
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

pub struct LiquidationService {
    broker: Arc<dyn BrokerClient>,
    max_retries: u32,
    base_delay: Duration,
    /// A submission that outlives this counts as a failed attempt
    call_timeout: Duration,
}

impl LiquidationService {
    pub fn new(
        broker: Arc<dyn BrokerClient>,
        max_retries: u32,
        base_delay: Duration,
        call_timeout: Duration,
    ) -> Self {
        Self {
            broker,
            max_retries: max_retries.max(1),
            base_delay,
            call_timeout,
        }
    }

    /// Market order that flattens `position`
    pub fn closing_order(position: &Position) -> OrderRequest {
        let mut request = OrderRequest::market(
            position.symbol.clone(),
            position.side().opposite(),
            position.quantity.abs(),
        );
        request.strategy_id = Some("panic_stop".to_string());
        request
    }

    /// Close every position independently, in the order given
    pub async fn liquidate_all(&self, positions: &[Position]) -> Vec<LiquidationOutcome> {
        let mut outcomes = Vec::with_capacity(positions.len());
        for position in positions.iter().filter(|p| !p.quantity.is_zero()) {
            outcomes.push(self.liquidate(position).await);
        }
        outcomes
    }

    /// Exponential backoff: base, 2x base, 4x base...
    pub async fn liquidate(&self, position: &Position) -> LiquidationOutcome {
        let request = Self::closing_order(position);
        let mut attempts = 0;
        loop {
            attempts += 1;
            match self.submit(&request).await {
                Ok(order_id) => {
                    info!(
                        "LiquidationService: closed {} {} (order {}, attempt {})",
                        request.quantity, request.symbol, order_id, attempts
                    );
                    return LiquidationOutcome {
                        symbol: position.symbol.clone(),
                        quantity: position.quantity,
                        success: true,
                        attempts,
                        order_id: Some(order_id),
                        error: None,
                    };
                }
                Err(e) if attempts >= self.max_retries => {
                    error!(
                        "LiquidationService: FAILED to close {} after {} attempts: {}",
                        request.symbol, attempts, e
                    );
                    return LiquidationOutcome {
                        symbol: position.symbol.clone(),
                        quantity: position.quantity,
                        success: false,
                        attempts,
                        order_id: None,
                        error: Some(e.to_string()),
                    };
                }
                Err(e) => {
                    let delay = self.base_delay * 2u32.pow(attempts - 1);
                    warn!(
                        "LiquidationService: close {} failed (attempt {}/{}): {}. Retrying in {:?}",
                        request.symbol, attempts, self.max_retries, e, delay
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn submit(&self, request: &OrderRequest) -> Result<String> {
        let result = match tokio::time::timeout(self.call_timeout, self.broker.submit_order(request)).await {
            Ok(result) => result?,
            Err(_) => anyhow::bail!(
                "order submission timed out after {}ms",
                self.call_timeout.as_millis()
            ),
        };
        match result.status {
            OrderStatus::Rejected | OrderStatus::Canceled => {
                anyhow::bail!("order {} was {}", result.order_id, result.status)
            }
            _ => Ok(result.order_id),
        }
    }
}
