use super::traits::{LiveStrategy, Signal};
use crate::domain::trading::types::Quote;
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet, VecDeque};
use tracing::debug;

pub const DEFAULT_SHORT_WINDOW: usize = 10;
pub const DEFAULT_LONG_WINDOW: usize = 50;

/// Short/long moving-average crossover over quote samples.
///
/// Buys on a golden cross. Sells the bought quantity on a death cross, and
/// only after having bought.
pub struct MovingAverageCrossover {
    id: String,
    symbols: Vec<String>,
    short_window: usize,
    long_window: usize,
    quantity: Decimal,
    samples: HashMap<String, VecDeque<Decimal>>,
    short_above: HashMap<String, bool>,
    holding: HashSet<String>,
}

impl MovingAverageCrossover {
    pub fn new(
        id: impl Into<String>,
        symbols: Vec<String>,
        short_window: usize,
        long_window: usize,
        quantity: Decimal,
    ) -> Self {
        let short_window = short_window.max(1);
        Self {
            id: id.into(),
            symbols,
            short_window,
            long_window: long_window.max(short_window + 1),
            quantity,
            samples: HashMap::new(),
            short_above: HashMap::new(),
            holding: HashSet::new(),
        }
    }

    fn average(window: &VecDeque<Decimal>, len: usize) -> Decimal {
        let sum: Decimal = window.iter().rev().take(len).sum();
        sum / Decimal::from(len)
    }

    fn evaluate(&mut self, quote: &Quote) -> Option<Signal> {
        let window = self.samples.entry(quote.symbol.clone()).or_default();
        window.push_back(quote.price);
        while window.len() > self.long_window {
            window.pop_front();
        }
        if window.len() < self.long_window {
            return None;
        }

        let short = Self::average(window, self.short_window);
        let long = Self::average(window, self.long_window);
        let above = short > long;
        let previous = self.short_above.insert(quote.symbol.clone(), above);

        match (previous, above) {
            (Some(false), true) => {
                debug!(
                    "MovingAverageCrossover [{}]: golden cross short={:.2} long={:.2}",
                    quote.symbol, short, long
                );
                self.holding.insert(quote.symbol.clone());
                Some(Signal::buy(
                    &quote.symbol,
                    self.quantity,
                    format!("Golden cross (short {:.2} > long {:.2})", short, long),
                ))
            }
            (Some(true), false) if self.holding.remove(&quote.symbol) => {
                debug!(
                    "MovingAverageCrossover [{}]: death cross short={:.2} long={:.2}",
                    quote.symbol, short, long
                );
                Some(Signal::sell(
                    &quote.symbol,
                    self.quantity,
                    format!("Death cross (short {:.2} < long {:.2})", short, long),
                ))
            }
            _ => None,
        }
    }
}

impl LiveStrategy for MovingAverageCrossover {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        "MovingAverageCrossover"
    }

    fn symbols(&self) -> &[String] {
        &self.symbols
    }

    fn on_tick(&mut self, quotes: &[Quote]) -> Vec<Signal> {
        let mut signals = Vec::new();
        for quote in quotes {
            if !self.symbols.contains(&quote.symbol) {
                continue;
            }
            if let Some(signal) = self.evaluate(quote) {
                signals.push(signal);
            }
        }
        signals
    }

    fn on_stop(&mut self) {
        self.samples.clear();
        self.short_above.clear();
    }
}
