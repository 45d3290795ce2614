use crate::domain::trading::types::OrderSide;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::Decimal;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal_macros::dec;

/// Trait defining a slippage simulation model.
///
/// Takes `&mut self` so seeded models can advance their generator and stay
/// reproducible across runs.
pub trait SlippageModel: Send {
    /// Effective execution price for a theoretical price.
    fn calculate_execution_price(&mut self, price: Decimal, side: OrderSide) -> Decimal;
}

/// Fixed basis-point slippage plus a seeded random component in `[0, jitter_bps]`.
///
/// Slippage always moves the price against the trader.
#[derive(Debug, Clone)]
pub struct SeededSlippage {
    base_bps: Decimal,
    jitter_bps: f64,
    rng: StdRng,
}

impl SeededSlippage {
    pub fn new(base_bps: Decimal, jitter_bps: Decimal, seed: u64) -> Self {
        Self {
            base_bps: base_bps.max(Decimal::ZERO),
            jitter_bps: jitter_bps.to_f64().unwrap_or(0.0).max(0.0),
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl SlippageModel for SeededSlippage {
    fn calculate_execution_price(&mut self, price: Decimal, side: OrderSide) -> Decimal {
        let jitter = if self.jitter_bps > 0.0 {
            // Round to 4dp so Decimal conversion is exact and repeatable
            let raw = self.rng.random_range(0.0..=self.jitter_bps);
            Decimal::from_f64((raw * 10_000.0).round() / 10_000.0).unwrap_or(Decimal::ZERO)
        } else {
            Decimal::ZERO
        };
        let pct = (self.base_bps + jitter) / dec!(10000);
        let adjusted = match side {
            OrderSide::Buy => price * (Decimal::ONE + pct),
            OrderSide::Sell => price * (Decimal::ONE - pct),
        };
        adjusted.max(Decimal::ZERO).round_dp(6)
    }
}

/// No Slippage model (perfect execution).
pub struct ZeroSlippage;

impl SlippageModel for ZeroSlippage {
    fn calculate_execution_price(&mut self, price: Decimal, _side: OrderSide) -> Decimal {
        price
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_slippage_moves_against_trader() {
        let mut model = SeededSlippage::new(dec!(10), Decimal::ZERO, 1);
        assert_eq!(
            model.calculate_execution_price(dec!(100), OrderSide::Buy),
            dec!(100.1)
        );
        assert_eq!(
            model.calculate_execution_price(dec!(100), OrderSide::Sell),
            dec!(99.9)
        );
    }

    #[test]
    fn test_same_seed_same_sequence() {
        let mut a = SeededSlippage::new(dec!(5), dec!(20), 7);
        let mut b = SeededSlippage::new(dec!(5), dec!(20), 7);
        for _ in 0..50 {
            assert_eq!(
                a.calculate_execution_price(dec!(50), OrderSide::Buy),
                b.calculate_execution_price(dec!(50), OrderSide::Buy)
            );
        }
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let mut model = SeededSlippage::new(Decimal::ZERO, dec!(10), 3);
        for _ in 0..100 {
            let price = model.calculate_execution_price(dec!(100), OrderSide::Buy);
            assert!(price >= dec!(100) && price <= dec!(100.1));
        }
    }
}
