use super::traits::{LiveStrategy, Signal};
use crate::domain::trading::types::Quote;
use rust_decimal::Decimal;
use std::collections::HashSet;

/// Buys each symbol once, on its first quote, and never sells
pub struct BuyAndHold {
    id: String,
    symbols: Vec<String>,
    quantity: Decimal,
    bought: HashSet<String>,
}

impl BuyAndHold {
    pub fn new(id: impl Into<String>, symbols: Vec<String>, quantity: Decimal) -> Self {
        Self {
            id: id.into(),
            symbols,
            quantity,
            bought: HashSet::new(),
        }
    }
}

impl LiveStrategy for BuyAndHold {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        "BuyAndHold"
    }

    fn symbols(&self) -> &[String] {
        &self.symbols
    }

    fn on_tick(&mut self, quotes: &[Quote]) -> Vec<Signal> {
        quotes
            .iter()
            .filter(|q| self.symbols.contains(&q.symbol))
            .filter(|q| self.bought.insert(q.symbol.clone()))
            .map(|q| Signal::buy(&q.symbol, self.quantity, "Initial buy-and-hold entry"))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    #[test]
    fn test_buys_each_symbol_once() {
        let mut strategy = BuyAndHold::new(
            "bh",
            vec!["AAPL".to_string(), "MSFT".to_string()],
            dec!(2),
        );
        let quotes: Vec<Quote> = ["AAPL", "MSFT", "TSLA"]
            .iter()
            .map(|s| Quote {
                symbol: s.to_string(),
                price: dec!(10),
                timestamp: Utc::now(),
            })
            .collect();

        assert_eq!(strategy.on_tick(&quotes).len(), 2);
        assert!(strategy.on_tick(&quotes).is_empty());
    }
}
