use super::{decimal_column, optional_decimal_column, timestamp_column};
use crate::domain::repositories::{OrderRepository, PositionRepository, TradeRepository};
use crate::domain::trading::types::{Order, OrderSide, OrderStatus, OrderType, Position, Trade};
use crate::infrastructure::persistence::database::Database;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::Row;
use sqlx::sqlite::SqliteRow;
use std::str::FromStr;
use tracing::debug;

pub struct SqliteOrderRepository {
    database: Database,
}

impl SqliteOrderRepository {
    pub fn new(database: Database) -> Self {
        Self { database }
    }

    fn map_row(row: &SqliteRow) -> Result<Order> {
        let side: String = row.try_get("side")?;
        let order_type: String = row.try_get("order_type")?;
        let status: String = row.try_get("status")?;
        let quantity: String = row.try_get("quantity")?;
        let filled_quantity: String = row.try_get("filled_quantity")?;

        Ok(Order {
            id: row.try_get("id")?,
            broker_order_id: row.try_get("broker_order_id")?,
            symbol: row.try_get("symbol")?,
            side: OrderSide::from_str(&side)?,
            order_type: OrderType::from_str(&order_type)?,
            quantity: decimal_column(&quantity, "quantity")?,
            limit_price: optional_decimal_column(row.try_get("limit_price")?, "limit_price")?,
            status: OrderStatus::from_str(&status)?,
            filled_quantity: decimal_column(&filled_quantity, "filled_quantity")?,
            filled_avg_price: optional_decimal_column(
                row.try_get("filled_avg_price")?,
                "filled_avg_price",
            )?,
            strategy_id: row.try_get("strategy_id")?,
            created_at: timestamp_column(row.try_get("created_at")?, "created_at")?,
            updated_at: timestamp_column(row.try_get("updated_at")?, "updated_at")?,
        })
    }
}

#[async_trait]
impl OrderRepository for SqliteOrderRepository {
    async fn save_order(&self, order: &Order) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO orders (
                id, broker_order_id, symbol, side, order_type, quantity, limit_price,
                status, filled_quantity, filled_avg_price, strategy_id, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                broker_order_id = excluded.broker_order_id,
                status = excluded.status,
                filled_quantity = excluded.filled_quantity,
                filled_avg_price = excluded.filled_avg_price,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&order.id)
        .bind(&order.broker_order_id)
        .bind(&order.symbol)
        .bind(order.side.to_string())
        .bind(order.order_type.to_string())
        .bind(order.quantity.to_string())
        .bind(order.limit_price.map(|p| p.to_string()))
        .bind(order.status.to_string())
        .bind(order.filled_quantity.to_string())
        .bind(order.filled_avg_price.map(|p| p.to_string()))
        .bind(&order.strategy_id)
        .bind(order.created_at.timestamp_millis())
        .bind(order.updated_at.timestamp_millis())
        .execute(&self.database.pool)
        .await
        .context("Failed to save order")?;

        debug!("Persistence: saved order {}", order.id);
        Ok(())
    }

    async fn get_order(&self, id: &str) -> Result<Option<Order>> {
        let row = sqlx::query("SELECT * FROM orders WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.database.pool)
            .await
            .context("Failed to load order")?;
        row.as_ref().map(Self::map_row).transpose()
    }

    async fn find_recent_orders(&self, limit: usize) -> Result<Vec<Order>> {
        let rows = sqlx::query("SELECT * FROM orders ORDER BY created_at DESC LIMIT ?")
            .bind(limit as i64)
            .fetch_all(&self.database.pool)
            .await
            .context("Failed to query orders")?;
        rows.iter().map(Self::map_row).collect()
    }
}

pub struct SqliteTradeRepository {
    database: Database,
}

impl SqliteTradeRepository {
    pub fn new(database: Database) -> Self {
        Self { database }
    }
}

#[async_trait]
impl TradeRepository for SqliteTradeRepository {
    async fn save_trade(&self, trade: &Trade) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO trades (id, order_id, symbol, side, quantity, price, fees, realized_pnl, executed_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO NOTHING
            "#,
        )
        .bind(&trade.id)
        .bind(&trade.order_id)
        .bind(&trade.symbol)
        .bind(trade.side.to_string())
        .bind(trade.quantity.to_string())
        .bind(trade.price.to_string())
        .bind(trade.fees.to_string())
        .bind(trade.realized_pnl.map(|p| p.to_string()))
        .bind(trade.executed_at.timestamp_millis())
        .execute(&self.database.pool)
        .await
        .context("Failed to save trade")?;

        Ok(())
    }

    async fn find_trades_by_symbol(&self, symbol: &str) -> Result<Vec<Trade>> {
        let rows = sqlx::query("SELECT * FROM trades WHERE symbol = ? ORDER BY executed_at DESC")
            .bind(symbol)
            .fetch_all(&self.database.pool)
            .await
            .context("Failed to query trades")?;

        let mut trades = Vec::with_capacity(rows.len());
        for row in rows {
            let side: String = row.try_get("side")?;
            let quantity: String = row.try_get("quantity")?;
            let price: String = row.try_get("price")?;
            let fees: String = row.try_get("fees")?;
            trades.push(Trade {
                id: row.try_get("id")?,
                order_id: row.try_get("order_id")?,
                symbol: row.try_get("symbol")?,
                side: OrderSide::from_str(&side)?,
                quantity: decimal_column(&quantity, "quantity")?,
                price: decimal_column(&price, "price")?,
                fees: decimal_column(&fees, "fees")?,
                realized_pnl: optional_decimal_column(row.try_get("realized_pnl")?, "realized_pnl")?,
                executed_at: timestamp_column(row.try_get("executed_at")?, "executed_at")?,
            });
        }
        Ok(trades)
    }

    async fn count_trades(&self) -> Result<usize> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM trades")
            .fetch_one(&self.database.pool)
            .await
            .context("Failed to count trades")?;
        Ok(count.max(0) as usize)
    }
}

pub struct SqlitePositionRepository {
    database: Database,
}

impl SqlitePositionRepository {
    pub fn new(database: Database) -> Self {
        Self { database }
    }

    fn map_row(row: &SqliteRow) -> Result<Position> {
        let quantity: String = row.try_get("quantity")?;
        let average_price: String = row.try_get("average_price")?;
        Ok(Position {
            symbol: row.try_get("symbol")?,
            quantity: decimal_column(&quantity, "quantity")?,
            average_price: decimal_column(&average_price, "average_price")?,
            current_price: optional_decimal_column(row.try_get("current_price")?, "current_price")?,
        })
    }
}

#[async_trait]
impl PositionRepository for SqlitePositionRepository {
    async fn upsert_position(&self, position: &Position) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO positions (symbol, quantity, average_price, current_price, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(symbol) DO UPDATE SET
                quantity = excluded.quantity,
                average_price = excluded.average_price,
                current_price = excluded.current_price,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&position.symbol)
        .bind(position.quantity.to_string())
        .bind(position.average_price.to_string())
        .bind(position.current_price.map(|p| p.to_string()))
        .bind(Utc::now().timestamp_millis())
        .execute(&self.database.pool)
        .await
        .context("Failed to save position")?;

        Ok(())
    }

    async fn get_position(&self, symbol: &str) -> Result<Option<Position>> {
        let row = sqlx::query("SELECT * FROM positions WHERE symbol = ?")
            .bind(symbol)
            .fetch_optional(&self.database.pool)
            .await
            .context("Failed to load position")?;
        row.as_ref().map(Self::map_row).transpose()
    }

    async fn list_positions(&self) -> Result<Vec<Position>> {
        let rows = sqlx::query("SELECT * FROM positions ORDER BY symbol")
            .fetch_all(&self.database.pool)
            .await
            .context("Failed to list positions")?;
        rows.iter().map(Self::map_row).collect()
    }

    async fn delete_position(&self, symbol: &str) -> Result<()> {
        sqlx::query("DELETE FROM positions WHERE symbol = ?")
            .bind(symbol)
            .execute(&self.database.pool)
            .await
            .context("Failed to delete position")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::trading::types::{OrderRequest, OrderResult};
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_order_and_trade_persist_decimals_exactly() {
        let db = Database::in_memory().await.unwrap();
        let orders = SqliteOrderRepository::new(db.clone());
        let trades = SqliteTradeRepository::new(db);

        let request = OrderRequest::limit("MSFT", OrderSide::Buy, dec!(2.5), dec!(401.17));
        let order = Order::from_request(
            &request,
            &OrderResult {
                order_id: "paper-9".to_string(),
                status: OrderStatus::Filled,
                filled_quantity: dec!(2.5),
                filled_avg_price: Some(dec!(401.17)),
            },
        );
        orders.save_order(&order).await.unwrap();
        trades
            .save_trade(&Trade::from_fill(&order, dec!(2.5), dec!(401.17)))
            .await
            .unwrap();

        let loaded = orders.get_order(&order.id).await.unwrap().unwrap();
        assert_eq!(loaded.limit_price, Some(dec!(401.17)));
        assert_eq!(loaded.order_type, OrderType::Limit);
        assert_eq!(trades.count_trades().await.unwrap(), 1);
        let by_symbol = trades.find_trades_by_symbol("MSFT").await.unwrap();
        assert_eq!(by_symbol[0].price, dec!(401.17));
    }

    #[tokio::test]
    async fn test_position_upsert_and_delete() {
        let repo = SqlitePositionRepository::new(Database::in_memory().await.unwrap());
        let mut position = Position {
            symbol: "AAPL".to_string(),
            quantity: dec!(10),
            average_price: dec!(150),
            current_price: None,
        };
        repo.upsert_position(&position).await.unwrap();
        position.quantity = dec!(4);
        repo.upsert_position(&position).await.unwrap();

        let all = repo.list_positions().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].quantity, dec!(4));

        repo.delete_position("AAPL").await.unwrap();
        assert!(repo.get_position("AAPL").await.unwrap().is_none());
    }
}
