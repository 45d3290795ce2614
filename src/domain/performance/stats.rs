use statrs::statistics::{Data, Distribution, Median, OrderStatistics};

const TRADING_DAYS_PER_YEAR: f64 = 252.0;

/// Shared statistics utilities for financial calculations.
pub struct Stats;

impl Stats {
    pub fn mean(values: &[f64]) -> f64 {
        if values.is_empty() {
            return 0.0;
        }
        values.iter().sum::<f64>() / values.len() as f64
    }

    /// Population standard deviation
    pub fn std_dev(values: &[f64]) -> f64 {
        if values.len() < 2 {
            return 0.0;
        }
        let mean = Self::mean(values);
        let variance =
            values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
        variance.sqrt()
    }

    /// Annualized Sharpe ratio of daily returns (risk-free rate 0)
    pub fn sharpe_ratio(returns: &[f64]) -> f64 {
        let std_dev = Self::std_dev(returns);
        if std_dev > 1e-12 {
            Self::mean(returns) * TRADING_DAYS_PER_YEAR.sqrt() / std_dev
        } else {
            0.0
        }
    }

    /// Annualized Sortino ratio: mean over downside deviation
    pub fn sortino_ratio(returns: &[f64]) -> f64 {
        if returns.is_empty() {
            return 0.0;
        }
        let downside_sq =
            returns.iter().map(|r| r.min(0.0).powi(2)).sum::<f64>() / returns.len() as f64;
        let downside = downside_sq.sqrt();
        if downside > 1e-12 {
            Self::mean(returns) * TRADING_DAYS_PER_YEAR.sqrt() / downside
        } else {
            0.0
        }
    }

    /// Annualized volatility of daily returns, in percent
    pub fn annualized_volatility_pct(returns: &[f64]) -> f64 {
        Self::std_dev(returns) * TRADING_DAYS_PER_YEAR.sqrt() * 100.0
    }

    /// Sample z-score of the last value against the whole window
    pub fn zscore(window: &[f64]) -> Option<f64> {
        let last = *window.last()?;
        let data = Data::new(window.to_vec());
        let mean = data.mean()?;
        let std_dev = data.std_dev()?;
        if std_dev <= 1e-12 {
            return None;
        }
        Some((last - mean) / std_dev)
    }

    pub fn median(values: &[f64]) -> f64 {
        if values.is_empty() {
            return 0.0;
        }
        Data::new(values.to_vec()).median()
    }

    /// Percentile in `0..=100`
    pub fn percentile(values: &[f64], pct: usize) -> f64 {
        if values.is_empty() {
            return 0.0;
        }
        Data::new(values.to_vec()).percentile(pct.min(100))
    }
}
