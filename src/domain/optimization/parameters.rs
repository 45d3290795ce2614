use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// Named parameter vector. Ordered so serialized output is stable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct StrategyParameters(BTreeMap<String, f64>);

impl StrategyParameters {
    pub fn new(values: BTreeMap<String, f64>) -> Self {
        Self(values)
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.0.get(name).copied()
    }

    pub fn value_or(&self, name: &str, default: f64) -> f64 {
        self.get(name).filter(|v| v.is_finite()).unwrap_or(default)
    }

    pub fn set(&mut self, name: impl Into<String>, value: f64) {
        self.0.insert(name.into(), value);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &f64)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, f64)> for StrategyParameters {
    fn from_iter<T: IntoIterator<Item = (String, f64)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Search bounds for one tunable parameter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterBound {
    pub name: String,
    pub default: f64,
    pub min: f64,
    pub max: f64,
    pub step: f64,
    #[serde(default)]
    pub integer: bool,
}

impl ParameterBound {
    fn new(name: &str, default: f64, min: f64, max: f64, step: f64) -> Self {
        Self {
            name: name.to_string(),
            default,
            min,
            max,
            step,
            integer: false,
        }
    }

    fn integer(mut self) -> Self {
        self.integer = true;
        self
    }

    pub fn span(&self) -> f64 {
        (self.max - self.min).max(0.0)
    }

    /// Clamp into range, snap to the step grid and round integer parameters
    pub fn normalize(&self, value: f64) -> f64 {
        let value = if value.is_finite() { value } else { self.default };
        let mut snapped = value.clamp(self.min, self.max);
        if self.step > 0.0 {
            snapped = round6((snapped / self.step).round() * self.step);
        }
        snapped = snapped.clamp(self.min, self.max);
        if self.integer {
            snapped = snapped.round();
        }
        snapped
    }
}

/// Optional per-request override of a bound
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundOverride {
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub step: Option<f64>,
}

fn round6(value: f64) -> f64 {
    (value * 1_000_000.0).round() / 1_000_000.0
}

/// The full tunable space with its coupling constraints
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSpace {
    bounds: Vec<ParameterBound>,
}

impl Default for ParameterSpace {
    fn default() -> Self {
        Self {
            bounds: vec![
                ParameterBound::new("position_size", 1000.0, 50.0, 10000.0, 25.0),
                ParameterBound::new("stop_loss_pct", 2.0, 0.5, 10.0, 0.25),
                ParameterBound::new("take_profit_pct", 5.0, 1.0, 20.0, 0.5),
                ParameterBound::new("risk_per_trade", 1.0, 0.1, 5.0, 0.1),
                ParameterBound::new("trailing_stop_pct", 2.5, 0.5, 15.0, 0.25),
                ParameterBound::new("atr_stop_mult", 2.0, 0.5, 5.0, 0.1),
                ParameterBound::new("zscore_entry_threshold", -1.2, -4.0, -0.2, 0.1),
                ParameterBound::new("dip_buy_threshold_pct", 1.5, 0.3, 10.0, 0.05),
                ParameterBound::new("max_hold_days", 10.0, 1.0, 60.0, 1.0).integer(),
                ParameterBound::new("dca_tranches", 1.0, 1.0, 3.0, 1.0).integer(),
                ParameterBound::new("max_consecutive_losses", 3.0, 1.0, 10.0, 1.0).integer(),
                ParameterBound::new("max_drawdown_pct", 15.0, 3.0, 50.0, 1.0),
                ParameterBound::new("lookback_period", 20.0, 10.0, 60.0, 5.0).integer(),
            ],
        }
    }
}

impl ParameterSpace {
    pub fn bounds(&self) -> &[ParameterBound] {
        &self.bounds
    }

    pub fn get(&self, name: &str) -> Option<&ParameterBound> {
        self.bounds.iter().find(|b| b.name == name)
    }

    pub fn defaults(&self) -> StrategyParameters {
        self.bounds
            .iter()
            .map(|b| (b.name.clone(), b.default))
            .collect()
    }

    /// Apply caller overrides. Inverted or non-positive-step overrides are ignored.
    pub fn with_overrides(mut self, overrides: &BTreeMap<String, BoundOverride>) -> Self {
        for bound in &mut self.bounds {
            let Some(ov) = overrides.get(&bound.name) else {
                continue;
            };
            let min = ov.min.unwrap_or(bound.min);
            let max = ov.max.unwrap_or(bound.max);
            if min.is_finite() && max.is_finite() && min <= max {
                bound.min = min;
                bound.max = max;
            }
            if let Some(step) = ov.step.filter(|s| s.is_finite() && *s > 0.0) {
                bound.step = step;
            }
        }
        self
    }

    /// Fill gaps from defaults, normalize every known parameter and enforce
    /// the stop/target couplings. Unknown parameters pass through untouched.
    pub fn normalize(&self, params: &StrategyParameters) -> StrategyParameters {
        let mut out = params.clone();
        for bound in &self.bounds {
            let raw = params.value_or(&bound.name, bound.default);
            out.set(bound.name.clone(), bound.normalize(raw));
        }
        self.enforce_constraints(&mut out);
        out
    }

    fn enforce_constraints(&self, params: &mut StrategyParameters) {
        let Some(stop) = params.get("stop_loss_pct") else {
            return;
        };
        if let (Some(tp), Some(bound)) = (params.get("take_profit_pct"), self.get("take_profit_pct"))
            && tp < stop * 1.8
        {
            params.set("take_profit_pct", bound.normalize(stop * 1.8 + bound.step));
        }
        if let (Some(trail), Some(bound)) =
            (params.get("trailing_stop_pct"), self.get("trailing_stop_pct"))
            && trail < stop * 0.9
        {
            params.set("trailing_stop_pct", bound.normalize(stop * 0.9 + bound.step));
        }
    }
}

/// Trim, uppercase and de-duplicate while keeping first-seen order
pub fn normalize_symbols<S: AsRef<str>>(symbols: &[S]) -> Vec<String> {
    let mut seen = HashSet::new();
    symbols
        .iter()
        .map(|s| s.as_ref().trim().to_ascii_uppercase())
        .filter(|s| !s.is_empty())
        .filter(|s| seen.insert(s.clone()))
        .collect()
}
