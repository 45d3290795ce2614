use crate::application::strategies::{BuyAndHold, LiveStrategy, MovingAverageCrossover};
use crate::application::strategies::moving_average_crossover::{
    DEFAULT_LONG_WINDOW, DEFAULT_SHORT_WINDOW,
};
use crate::domain::optimization::parameters::normalize_symbols;
use crate::domain::strategy::StrategyRecord;
use anyhow::Result;
use rust_decimal::Decimal;
use rust_decimal::prelude::FromPrimitive;

pub struct StrategyFactory;

impl StrategyFactory {
    /// Build the live implementation named by `record.kind`
    pub fn create(record: &StrategyRecord) -> Result<Box<dyn LiveStrategy>> {
        let symbols = normalize_symbols(&record.symbols);
        if symbols.is_empty() {
            anyhow::bail!("Strategy {} has no symbols", record.id);
        }
        let quantity = Decimal::from_f64(record.parameters.value_or("quantity", 1.0))
            .filter(|q| *q > Decimal::ZERO)
            .unwrap_or(Decimal::ONE);

        match record.kind.trim().to_lowercase().as_str() {
            "moving_average_crossover" | "ma_crossover" | "sma_crossover" => {
                let short = record
                    .parameters
                    .value_or("short_window", DEFAULT_SHORT_WINDOW as f64);
                let long = record
                    .parameters
                    .value_or("long_window", DEFAULT_LONG_WINDOW as f64);
                Ok(Box::new(MovingAverageCrossover::new(
                    record.id.clone(),
                    symbols,
                    short.round().max(1.0) as usize,
                    long.round().max(2.0) as usize,
                    quantity,
                )))
            }
            "buy_and_hold" => Ok(Box::new(BuyAndHold::new(
                record.id.clone(),
                symbols,
                quantity,
            ))),
            other => anyhow::bail!("Unknown strategy kind '{}' for {}", other, record.id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::optimization::parameters::StrategyParameters;
    use chrono::Utc;

    fn record(kind: &str, symbols: &[&str]) -> StrategyRecord {
        StrategyRecord {
            id: "s1".to_string(),
            name: "test".to_string(),
            kind: kind.to_string(),
            symbols: symbols.iter().map(|s| s.to_string()).collect(),
            parameters: StrategyParameters::default(),
            active: true,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_creates_known_kinds() {
        let strategy = StrategyFactory::create(&record("MA_Crossover", &[" aapl "])).unwrap();
        assert_eq!(strategy.name(), "MovingAverageCrossover");
        assert_eq!(strategy.symbols(), ["AAPL".to_string()]);

        let strategy = StrategyFactory::create(&record("buy_and_hold", &["MSFT"])).unwrap();
        assert_eq!(strategy.name(), "BuyAndHold");
    }

    #[test]
    fn test_rejects_unknown_kind_and_empty_symbols() {
        assert!(StrategyFactory::create(&record("martingale", &["AAPL"])).is_err());
        assert!(StrategyFactory::create(&record("buy_and_hold", &[])).is_err());
    }
}
