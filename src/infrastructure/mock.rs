//! Deterministic collaborators for headless runs and tests: a synthetic
//! market data feed and an in-memory paper broker.

use crate::domain::ports::{BrokerClient, MarketDataProvider};
use crate::domain::trading::types::{
    Account, Candle, OrderRequest, OrderResult, OrderSide, OrderStatus, OrderType, Position, Quote,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc, Weekday};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::Decimal;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::RwLock;
use tracing::info;

/// First session of every generated series. Bars for a given date never
/// depend on the requested range.
const SERIES_EPOCH: (i32, u32, u32) = (2015, 1, 1);
const REVERSION: f64 = 0.92;
const WALK_STEP: f64 = 0.012;

/// Reproducible daily bars: a mean-reverting oscillation around a per-symbol
/// base price plus a seeded random walk.
#[derive(Clone)]
pub struct SyntheticMarketData {
    seed: u64,
    overrides: Arc<RwLock<HashMap<String, Decimal>>>,
}

impl SyntheticMarketData {
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            overrides: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Pin the live quote for `symbol`
    pub async fn set_price(&self, symbol: &str, price: Decimal) {
        self.overrides
            .write()
            .await
            .insert(symbol.to_uppercase(), price);
    }

    fn symbol_seed(&self, symbol: &str) -> u64 {
        // FNV-1a
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for byte in symbol.to_uppercase().bytes() {
            hash ^= byte as u64;
            hash = hash.wrapping_mul(0x0100_0000_01b3);
        }
        hash ^ self.seed
    }

    /// Bars from the series epoch through `end`, weekdays only
    pub fn generate(&self, symbol: &str, end: NaiveDate) -> Vec<Candle> {
        let Some(epoch) = NaiveDate::from_ymd_opt(SERIES_EPOCH.0, SERIES_EPOCH.1, SERIES_EPOCH.2)
        else {
            return Vec::new();
        };
        let seed = self.symbol_seed(symbol);
        let mut rng = StdRng::seed_from_u64(seed);
        let base = 40.0 + (seed % 260) as f64;
        let period = 18.0 + (seed % 23) as f64;
        let amplitude = 0.04 + (seed % 7) as f64 * 0.01;

        let mut bars = Vec::new();
        let mut walk = 0.0_f64;
        let mut prev_close = base;
        let mut date = epoch;
        let mut index = 0u32;
        while date <= end {
            if !matches!(date.weekday(), Weekday::Sat | Weekday::Sun) {
                walk = walk * REVERSION + rng.random_range(-WALK_STEP..WALK_STEP);
                let cycle = (index as f64 * std::f64::consts::TAU / period).sin() * amplitude;
                let close = (base * (1.0 + cycle) * walk.exp()).max(1.0);
                let spread = close * rng.random_range(0.002..0.015);
                let high = close.max(prev_close) + spread;
                let low = (close.min(prev_close) - spread).max(0.5);
                let volume: f64 = 100_000.0 + rng.random_range(0.0..900_000.0);

                bars.push(Candle {
                    symbol: symbol.to_uppercase(),
                    open: to_price(prev_close),
                    high: to_price(high),
                    low: to_price(low),
                    close: to_price(close),
                    volume: Decimal::from_f64(volume.round()).unwrap_or(Decimal::ZERO),
                    timestamp: date
                        .and_hms_opt(0, 0, 0)
                        .map(|dt| dt.and_utc().timestamp())
                        .unwrap_or_default(),
                });
                prev_close = close;
                index += 1;
            }
            date += Duration::days(1);
        }
        bars
    }
}

fn to_price(value: f64) -> Decimal {
    Decimal::from_f64(value)
        .map(|d| d.round_dp(2))
        .unwrap_or(Decimal::ONE)
}

impl Default for SyntheticMarketData {
    fn default() -> Self {
        Self::new(42)
    }
}

#[async_trait]
impl MarketDataProvider for SyntheticMarketData {
    async fn latest_quote(&self, symbol: &str) -> Result<Quote> {
        let now = Utc::now();
        if let Some(price) = self.overrides.read().await.get(&symbol.to_uppercase()) {
            return Ok(Quote {
                symbol: symbol.to_uppercase(),
                price: *price,
                timestamp: now,
            });
        }

        let last = self
            .generate(symbol, now.date_naive())
            .pop()
            .with_context(|| format!("No synthetic history for {}", symbol))?;
        // Small intraday swing so consecutive polls differ
        let minutes = now.timestamp() / 60;
        let swing = 1.0 + ((minutes as f64) / 7.0).sin() * 0.004;
        let close = last.close.to_f64().unwrap_or(1.0);
        Ok(Quote {
            symbol: last.symbol,
            price: to_price(close * swing),
            timestamp: now,
        })
    }

    async fn historical_bars(
        &self,
        symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<Candle>> {
        Ok(self
            .generate(symbol, end)
            .into_iter()
            .filter(|c| c.session_date() >= start)
            .collect())
    }
}

struct PaperOrder {
    request: OrderRequest,
    result: OrderResult,
}

#[derive(Default)]
struct PaperBook {
    cash: Decimal,
    positions: HashMap<String, Position>,
    orders: HashMap<String, PaperOrder>,
}

/// In-memory broker. Market orders fill at the current quote; limit orders
/// rest as pending until canceled.
pub struct PaperBroker {
    market_data: Arc<dyn MarketDataProvider>,
    book: RwLock<PaperBook>,
    next_order_id: AtomicU64,
    connected: AtomicBool,
    market_open: AtomicBool,
    next_open: RwLock<Option<DateTime<Utc>>>,
    /// `None` means every symbol is tradable
    tradable: RwLock<Option<HashSet<String>>>,
}

impl PaperBroker {
    pub fn new(market_data: Arc<dyn MarketDataProvider>, starting_cash: Decimal) -> Self {
        Self {
            market_data,
            book: RwLock::new(PaperBook {
                cash: starting_cash,
                ..PaperBook::default()
            }),
            next_order_id: AtomicU64::new(1),
            connected: AtomicBool::new(false),
            market_open: AtomicBool::new(true),
            next_open: RwLock::new(None),
            tradable: RwLock::new(None),
        }
    }

    pub fn set_market_open(&self, open: bool) {
        self.market_open.store(open, Ordering::SeqCst);
    }

    pub async fn set_next_open(&self, at: Option<DateTime<Utc>>) {
        *self.next_open.write().await = at;
    }

    pub async fn set_tradable_symbols(&self, symbols: Option<Vec<String>>) {
        *self.tradable.write().await =
            symbols.map(|s| s.into_iter().map(|x| x.to_uppercase()).collect());
    }

    /// Seed a holding, as if filled before this process started
    pub async fn seed_position(&self, position: Position) {
        self.book
            .write()
            .await
            .positions
            .insert(position.symbol.clone(), position);
    }

    fn apply_fill(book: &mut PaperBook, request: &OrderRequest, price: Decimal) -> Result<()> {
        let notional = price * request.quantity;
        match request.side {
            OrderSide::Buy => {
                if notional > book.cash {
                    anyhow::bail!(
                        "Insufficient cash: need {:.2}, have {:.2}",
                        notional,
                        book.cash
                    );
                }
                book.cash -= notional;
                let position = book
                    .positions
                    .entry(request.symbol.clone())
                    .or_insert_with(|| Position {
                        symbol: request.symbol.clone(),
                        quantity: Decimal::ZERO,
                        average_price: Decimal::ZERO,
                        current_price: None,
                    });
                let total_qty = position.quantity + request.quantity;
                if total_qty > Decimal::ZERO {
                    position.average_price =
                        (position.quantity * position.average_price + notional) / total_qty;
                }
                position.quantity = total_qty;
                position.current_price = Some(price);
            }
            OrderSide::Sell => {
                let held = book
                    .positions
                    .get(&request.symbol)
                    .map(|p| p.quantity)
                    .unwrap_or(Decimal::ZERO);
                if request.quantity > held {
                    anyhow::bail!(
                        "Cannot sell {} {}: only {} held",
                        request.quantity,
                        request.symbol,
                        held
                    );
                }
                book.cash += notional;
                let remaining = held - request.quantity;
                if remaining.is_zero() {
                    book.positions.remove(&request.symbol);
                } else if let Some(position) = book.positions.get_mut(&request.symbol) {
                    position.quantity = remaining;
                    position.current_price = Some(price);
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl BrokerClient for PaperBroker {
    async fn connect(&self) -> Result<()> {
        self.connected.store(true, Ordering::SeqCst);
        info!("PaperBroker: connected");
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn is_market_open(&self) -> Result<bool> {
        Ok(self.market_open.load(Ordering::SeqCst))
    }

    async fn next_market_open(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(*self.next_open.read().await)
    }

    async fn is_symbol_tradable(&self, symbol: &str) -> Result<bool> {
        Ok(self
            .tradable
            .read()
            .await
            .as_ref()
            .is_none_or(|set| set.contains(&symbol.to_uppercase())))
    }

    async fn get_account(&self) -> Result<Account> {
        let book = self.book.read().await;
        let positions_value: Decimal = book.positions.values().map(|p| p.market_value()).sum();
        Ok(Account {
            cash: book.cash,
            equity: book.cash + positions_value,
            buying_power: book.cash,
        })
    }

    async fn get_positions(&self) -> Result<Vec<Position>> {
        let book = self.book.read().await;
        let mut positions: Vec<Position> = book.positions.values().cloned().collect();
        positions.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        Ok(positions)
    }

    async fn submit_order(&self, request: &OrderRequest) -> Result<OrderResult> {
        let order_id = format!("paper-{}", self.next_order_id.fetch_add(1, Ordering::SeqCst));

        let result = match request.order_type {
            OrderType::Limit => OrderResult {
                order_id: order_id.clone(),
                status: OrderStatus::Pending,
                filled_quantity: Decimal::ZERO,
                filled_avg_price: None,
            },
            OrderType::Market => {
                let quote = self.market_data.latest_quote(&request.symbol).await?;
                let mut book = self.book.write().await;
                match Self::apply_fill(&mut book, request, quote.price) {
                    Ok(()) => OrderResult {
                        order_id: order_id.clone(),
                        status: OrderStatus::Filled,
                        filled_quantity: request.quantity,
                        filled_avg_price: Some(quote.price),
                    },
                    Err(e) => {
                        info!("PaperBroker: rejected {}: {}", order_id, e);
                        OrderResult {
                            order_id: order_id.clone(),
                            status: OrderStatus::Rejected,
                            filled_quantity: Decimal::ZERO,
                            filled_avg_price: None,
                        }
                    }
                }
            }
        };

        info!(
            "PaperBroker: {} {} {} {} -> {}",
            order_id, request.side, request.quantity, request.symbol, result.status
        );
        self.book.write().await.orders.insert(
            order_id,
            PaperOrder {
                request: request.clone(),
                result: result.clone(),
            },
        );
        Ok(result)
    }

    async fn cancel_order(&self, order_id: &str) -> Result<()> {
        let mut book = self.book.write().await;
        let order = book
            .orders
            .get_mut(order_id)
            .with_context(|| format!("Unknown order {}", order_id))?;
        if order.result.status.is_final() {
            anyhow::bail!(
                "Order {} ({}) is already {}",
                order_id,
                order.request.symbol,
                order.result.status
            );
        }
        order.result.status = OrderStatus::Canceled;
        Ok(())
    }

    async fn get_order_status(&self, order_id: &str) -> Result<OrderResult> {
        self.book
            .read()
            .await
            .orders
            .get(order_id)
            .map(|o| o.result.clone())
            .with_context(|| format!("Unknown order {}", order_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[tokio::test]
    async fn test_bars_are_reproducible_and_range_independent() {
        let data = SyntheticMarketData::new(7);
        let wide = data
            .historical_bars("AAPL", date(2023, 1, 1), date(2023, 6, 30))
            .await
            .unwrap();
        let narrow = data
            .historical_bars("AAPL", date(2023, 3, 1), date(2023, 3, 31))
            .await
            .unwrap();
        let again = SyntheticMarketData::new(7)
            .historical_bars("aapl", date(2023, 3, 1), date(2023, 3, 31))
            .await
            .unwrap();

        assert_eq!(narrow, again);
        let overlap: Vec<&Candle> = wide
            .iter()
            .filter(|c| c.session_date() >= date(2023, 3, 1) && c.session_date() <= date(2023, 3, 31))
            .collect();
        assert_eq!(overlap.len(), narrow.len());
        assert_eq!(*overlap[0], narrow[0]);
        assert!(narrow.iter().all(|c| c.low <= c.close && c.close <= c.high));
    }

    #[tokio::test]
    async fn test_symbols_get_different_series() {
        let data = SyntheticMarketData::default();
        let a = data.generate("AAPL", date(2022, 1, 31));
        let b = data.generate("MSFT", date(2022, 1, 31));
        assert_ne!(a.last().unwrap().close, b.last().unwrap().close);
    }

    #[tokio::test]
    async fn test_market_buy_then_sell_round_trip() {
        let data = SyntheticMarketData::default();
        data.set_price("AAPL", dec!(100)).await;
        let broker = PaperBroker::new(Arc::new(data.clone()), dec!(10000));

        let buy = broker
            .submit_order(&OrderRequest::market("AAPL", OrderSide::Buy, dec!(10)))
            .await
            .unwrap();
        assert_eq!(buy.status, OrderStatus::Filled);
        assert_eq!(buy.order_id, "paper-1");
        assert_eq!(broker.get_account().await.unwrap().cash, dec!(9000));

        data.set_price("AAPL", dec!(110)).await;
        let sell = broker
            .submit_order(&OrderRequest::market("AAPL", OrderSide::Sell, dec!(10)))
            .await
            .unwrap();
        assert_eq!(sell.status, OrderStatus::Filled);
        assert!(broker.get_positions().await.unwrap().is_empty());
        assert_eq!(broker.get_account().await.unwrap().cash, dec!(10100));
    }

    #[tokio::test]
    async fn test_limit_orders_rest_until_canceled() {
        let broker = PaperBroker::new(Arc::new(SyntheticMarketData::default()), dec!(1000));
        let result = broker
            .submit_order(&OrderRequest::limit("AAPL", OrderSide::Buy, dec!(1), dec!(5)))
            .await
            .unwrap();
        assert_eq!(result.status, OrderStatus::Pending);

        broker.cancel_order(&result.order_id).await.unwrap();
        let status = broker.get_order_status(&result.order_id).await.unwrap();
        assert_eq!(status.status, OrderStatus::Canceled);
        assert!(broker.cancel_order(&result.order_id).await.is_err());
    }

    #[tokio::test]
    async fn test_oversell_is_rejected() {
        let data = SyntheticMarketData::default();
        data.set_price("TSLA", dec!(200)).await;
        let broker = PaperBroker::new(Arc::new(data), dec!(1000));
        let result = broker
            .submit_order(&OrderRequest::market("TSLA", OrderSide::Sell, dec!(1)))
            .await
            .unwrap();
        assert_eq!(result.status, OrderStatus::Rejected);
    }

    #[tokio::test]
    async fn test_tradable_set_and_market_flag() {
        let broker = PaperBroker::new(Arc::new(SyntheticMarketData::default()), dec!(1000));
        assert!(broker.is_symbol_tradable("ANY").await.unwrap());
        broker
            .set_tradable_symbols(Some(vec!["aapl".to_string()]))
            .await;
        assert!(broker.is_symbol_tradable("AAPL").await.unwrap());
        assert!(!broker.is_symbol_tradable("MSFT").await.unwrap());

        broker.set_market_open(false);
        assert!(!broker.is_market_open().await.unwrap());

        assert_eq!(broker.next_market_open().await.unwrap(), None);
        let open_at = Utc::now() + chrono::Duration::hours(12);
        broker.set_next_open(Some(open_at)).await;
        assert_eq!(broker.next_market_open().await.unwrap(), Some(open_at));
    }
}
