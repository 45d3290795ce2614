use crate::domain::trading::types::{OrderSide, OrderType, Quote};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalKind {
    Buy,
    Sell,
    Hold,
    /// Flatten whatever is held in the symbol
    Close,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub kind: SignalKind,
    pub symbol: String,
    pub quantity: Decimal,
    pub order_type: OrderType,
    pub limit_price: Option<Decimal>,
    pub reason: String,
}

impl Signal {
    fn market(kind: SignalKind, symbol: &str, quantity: Decimal, reason: String) -> Self {
        Self {
            kind,
            symbol: symbol.to_uppercase(),
            quantity,
            order_type: OrderType::Market,
            limit_price: None,
            reason,
        }
    }

    pub fn buy(symbol: &str, quantity: Decimal, reason: impl Into<String>) -> Self {
        Self::market(SignalKind::Buy, symbol, quantity, reason.into())
    }

    pub fn sell(symbol: &str, quantity: Decimal, reason: impl Into<String>) -> Self {
        Self::market(SignalKind::Sell, symbol, quantity, reason.into())
    }

    pub fn close(symbol: &str, reason: impl Into<String>) -> Self {
        Self::market(SignalKind::Close, symbol, Decimal::ZERO, reason.into())
    }

    pub fn with_limit(mut self, price: Decimal) -> Self {
        self.order_type = OrderType::Limit;
        self.limit_price = Some(price);
        self
    }

    /// Order side for actionable signals; `None` for Hold and Close
    pub fn side(&self) -> Option<OrderSide> {
        match self.kind {
            SignalKind::Buy => Some(OrderSide::Buy),
            SignalKind::Sell => Some(OrderSide::Sell),
            SignalKind::Hold | SignalKind::Close => None,
        }
    }
}

/// A strategy driven by the live runner.
///
/// Strategies keep their own rolling state, so ticks take `&mut self`. The
/// runner calls `on_start` once before the first tick and `on_stop` when the
/// loop exits.
pub trait LiveStrategy: Send {
    fn id(&self) -> &str;

    fn name(&self) -> &str;

    fn symbols(&self) -> &[String];

    fn on_start(&mut self) {}

    /// Quotes for every tracked symbol this tick; may include symbols the
    /// strategy does not trade.
    fn on_tick(&mut self, quotes: &[Quote]) -> Vec<Signal>;

    fn on_stop(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_limit_signal_keeps_side() {
        let signal = Signal::buy("aapl", dec!(3), "dip").with_limit(dec!(101.5));
        assert_eq!(signal.symbol, "AAPL");
        assert_eq!(signal.order_type, OrderType::Limit);
        assert_eq!(signal.limit_price, Some(dec!(101.5)));
        assert_eq!(signal.side(), Some(OrderSide::Buy));
        assert_eq!(Signal::close("MSFT", "exit").side(), None);
    }
}
