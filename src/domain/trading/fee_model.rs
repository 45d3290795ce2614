use crate::domain::trading::types::OrderSide;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::fmt::Debug;

#[derive(Debug, Clone, PartialEq)]
pub struct TradeCost {
    pub fee: Decimal,
    pub slippage_cost: Decimal,
    pub total_impact: Decimal,
}

pub trait FeeModel: Debug + Send + Sync {
    /// Commission for a fill at `price` (slippage already applied)
    fn calculate_cost(&self, quantity: Decimal, price: Decimal, side: OrderSide) -> TradeCost;

    fn description(&self) -> String;
}

/// Commission charged as basis points of fill notional
#[derive(Debug, Clone)]
pub struct BasisPointFeeModel {
    pub fee_bps: Decimal,
}

impl BasisPointFeeModel {
    pub fn new(fee_bps: Decimal) -> Self {
        Self {
            fee_bps: fee_bps.max(Decimal::ZERO),
        }
    }
}

impl FeeModel for BasisPointFeeModel {
    fn calculate_cost(&self, quantity: Decimal, price: Decimal, _side: OrderSide) -> TradeCost {
        let fee = (quantity * price * self.fee_bps / dec!(10000)).round_dp(6);
        TradeCost {
            fee,
            slippage_cost: Decimal::ZERO,
            total_impact: fee,
        }
    }

    fn description(&self) -> String {
        format!("Basis Point Fee Model ({} bps)", self.fee_bps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basis_point_fee() {
        let model = BasisPointFeeModel::new(dec!(10));
        let cost = model.calculate_cost(dec!(10), dec!(100), OrderSide::Buy);
        assert_eq!(cost.fee, dec!(1));
        assert_eq!(cost.total_impact, dec!(1));
    }

    #[test]
    fn test_negative_fee_clamped() {
        let model = BasisPointFeeModel::new(dec!(-5));
        let cost = model.calculate_cost(dec!(10), dec!(100), OrderSide::Sell);
        assert_eq!(cost.fee, Decimal::ZERO);
    }
}
