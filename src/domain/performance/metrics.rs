use crate::domain::backtest::{EquityPoint, SimulatedTrade};
use crate::domain::performance::stats::Stats;
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};

/// Profit factor reported when there are wins but no losses
const PROFIT_FACTOR_CAP: f64 = 100.0;

/// Performance report of one simulated run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct BacktestMetrics {
    // Returns
    pub total_return_pct: f64,
    pub annualized_return_pct: f64,

    // Risk-adjusted
    pub sharpe_ratio: f64,
    pub sortino_ratio: f64,
    pub calmar_ratio: f64,
    pub volatility_pct: f64,

    // Drawdown (positive percentages / currency)
    pub max_drawdown_pct: f64,
    pub max_drawdown: f64,
    pub recovery_factor: f64,

    // Trade statistics
    pub total_trades: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,
    pub win_rate: f64,
    pub gross_profit: Decimal,
    pub gross_loss: Decimal,
    pub profit_factor: f64,
    pub expectancy: f64,
    pub average_win: f64,
    pub average_loss: f64,
    pub avg_win_loss_ratio: f64,
    pub max_consecutive_wins: usize,
    pub max_consecutive_losses: usize,
    pub avg_hold_days: f64,
    pub total_fees: Decimal,
}

fn finite(value: f64) -> f64 {
    if value.is_finite() { value } else { 0.0 }
}

fn to_f64(value: Decimal) -> f64 {
    value.to_f64().unwrap_or(0.0)
}

impl BacktestMetrics {
    /// Calculate the full metrics bundle from closed trades and the daily equity curve.
    ///
    /// Daily returns strip out contributions so deposits never count as performance.
    pub fn calculate(trades: &[SimulatedTrade], equity_curve: &[EquityPoint]) -> Self {
        let returns = Self::calculate_returns(equity_curve);
        let (max_drawdown_pct, max_drawdown) = Self::calculate_max_drawdown(equity_curve);

        let (total_return_pct, net_profit) = match equity_curve.last() {
            Some(last) if last.contributed > Decimal::ZERO => {
                let profit = last.equity - last.contributed;
                (to_f64(profit / last.contributed) * 100.0, to_f64(profit))
            }
            _ => (0.0, 0.0),
        };

        let period_days = match (equity_curve.first(), equity_curve.last()) {
            (Some(first), Some(last)) => (last.date - first.date).num_days() as f64,
            _ => 0.0,
        };
        let annualized_return_pct = if period_days >= 1.0 && total_return_pct > -100.0 {
            ((1.0 + total_return_pct / 100.0).powf(365.0 / period_days) - 1.0) * 100.0
        } else {
            0.0
        };

        let total_trades = trades.len();
        let wins: Vec<&SimulatedTrade> = trades.iter().filter(|t| t.pnl > Decimal::ZERO).collect();
        let losses: Vec<&SimulatedTrade> =
            trades.iter().filter(|t| t.pnl <= Decimal::ZERO).collect();

        let win_rate = if total_trades > 0 {
            wins.len() as f64 / total_trades as f64 * 100.0
        } else {
            0.0
        };

        let gross_profit: Decimal = wins.iter().map(|t| t.pnl).sum();
        let gross_loss: Decimal = losses.iter().map(|t| t.pnl).sum::<Decimal>().abs();
        let profit_factor = if gross_loss > Decimal::ZERO {
            to_f64(gross_profit / gross_loss)
        } else if gross_profit > Decimal::ZERO {
            PROFIT_FACTOR_CAP
        } else {
            0.0
        };

        let average_win = if wins.is_empty() {
            0.0
        } else {
            to_f64(gross_profit) / wins.len() as f64
        };
        let average_loss = if losses.is_empty() {
            0.0
        } else {
            to_f64(gross_loss) / losses.len() as f64
        };
        let avg_win_loss_ratio = if average_loss > 0.0 {
            average_win / average_loss
        } else {
            0.0
        };
        let expectancy = if total_trades > 0 {
            to_f64(trades.iter().map(|t| t.pnl).sum::<Decimal>()) / total_trades as f64
        } else {
            0.0
        };

        let (max_consecutive_wins, max_consecutive_losses) =
            Self::calculate_consecutive_streaks(trades);

        let avg_hold_days = if total_trades > 0 {
            trades.iter().map(|t| t.hold_days as f64).sum::<f64>() / total_trades as f64
        } else {
            0.0
        };
        let total_fees: Decimal = trades.iter().map(|t| t.fees).sum();

        let recovery_factor = if max_drawdown > 0.0 {
            net_profit / max_drawdown
        } else {
            0.0
        };
        let calmar_ratio = if max_drawdown_pct > 0.01 {
            annualized_return_pct / max_drawdown_pct
        } else {
            0.0
        };

        Self {
            total_return_pct: finite(total_return_pct),
            annualized_return_pct: finite(annualized_return_pct),
            sharpe_ratio: finite(Stats::sharpe_ratio(&returns)),
            sortino_ratio: finite(Stats::sortino_ratio(&returns)),
            calmar_ratio: finite(calmar_ratio),
            volatility_pct: finite(Stats::annualized_volatility_pct(&returns)),
            max_drawdown_pct: finite(max_drawdown_pct),
            max_drawdown: finite(max_drawdown),
            recovery_factor: finite(recovery_factor),
            total_trades,
            winning_trades: wins.len(),
            losing_trades: losses.len(),
            win_rate,
            gross_profit,
            gross_loss,
            profit_factor: finite(profit_factor),
            expectancy: finite(expectancy),
            average_win: finite(average_win),
            average_loss: finite(average_loss),
            avg_win_loss_ratio: finite(avg_win_loss_ratio),
            max_consecutive_wins,
            max_consecutive_losses,
            avg_hold_days,
            total_fees,
        }
    }

    /// Daily returns net of the capital contributed that day
    fn calculate_returns(equity_curve: &[EquityPoint]) -> Vec<f64> {
        equity_curve
            .windows(2)
            .filter_map(|pair| {
                let prev = to_f64(pair[0].equity);
                let deposit = to_f64(pair[1].contributed - pair[0].contributed);
                let curr = to_f64(pair[1].equity) - deposit;
                (prev > 0.0).then(|| (curr - prev) / prev)
            })
            .collect()
    }

    /// Max peak-to-trough decline of the contribution-adjusted equity index.
    /// Returns (percent, currency at the trough).
    fn calculate_max_drawdown(equity_curve: &[EquityPoint]) -> (f64, f64) {
        let returns = Self::calculate_returns(equity_curve);
        let Some(first) = equity_curve.first() else {
            return (0.0, 0.0);
        };

        let mut index = 1.0_f64;
        let mut peak = 1.0_f64;
        let mut max_dd_pct = 0.0_f64;
        let mut max_dd_cash = 0.0_f64;
        let mut peak_equity = to_f64(first.equity);

        for (ret, point) in returns.iter().zip(equity_curve.iter().skip(1)) {
            index *= 1.0 + ret;
            let equity = to_f64(point.equity);
            if index > peak {
                peak = index;
                peak_equity = equity;
            }
            let dd_pct = ((peak - index) / peak * 100.0).min(100.0);
            if dd_pct > max_dd_pct {
                max_dd_pct = dd_pct;
                max_dd_cash = peak_equity * dd_pct / 100.0;
            }
        }

        (max_dd_pct, max_dd_cash)
    }

    fn calculate_consecutive_streaks(trades: &[SimulatedTrade]) -> (usize, usize) {
        let mut max_wins = 0;
        let mut max_losses = 0;
        let mut wins = 0;
        let mut losses = 0;

        for trade in trades {
            if trade.pnl > Decimal::ZERO {
                wins += 1;
                losses = 0;
                max_wins = max_wins.max(wins);
            } else {
                losses += 1;
                wins = 0;
                max_losses = max_losses.max(losses);
            }
        }

        (max_wins, max_losses)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::backtest::ExitReason;
    use chrono::{Duration, NaiveDate};
    use rust_decimal_macros::dec;

    fn day(n: i64) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, 1).unwrap() + Duration::days(n)
    }

    fn point(n: i64, equity: Decimal, contributed: Decimal) -> EquityPoint {
        EquityPoint {
            date: day(n),
            equity,
            cash: equity,
            positions_value: Decimal::ZERO,
            contributed,
        }
    }

    fn trade(pnl: Decimal, hold_days: i64) -> SimulatedTrade {
        SimulatedTrade {
            symbol: "AAPL".to_string(),
            entry_date: day(0),
            exit_date: day(hold_days),
            entry_price: dec!(100),
            exit_price: dec!(100),
            quantity: dec!(1),
            pnl,
            return_pct: 0.0,
            fees: dec!(1),
            hold_days,
            tranches: 1,
            exit_reason: ExitReason::TimeExit,
        }
    }

    #[test]
    fn test_trade_statistics() {
        let trades = vec![
            trade(dec!(100), 2),
            trade(dec!(-50), 4),
            trade(dec!(-50), 1),
            trade(dec!(200), 5),
        ];
        let curve = vec![
            point(0, dec!(10000), dec!(10000)),
            point(1, dec!(10200), dec!(10000)),
        ];
        let m = BacktestMetrics::calculate(&trades, &curve);
        assert_eq!(m.total_trades, 4);
        assert_eq!(m.win_rate, 50.0);
        assert_eq!(m.profit_factor, 3.0);
        assert_eq!(m.expectancy, 50.0);
        assert_eq!(m.avg_win_loss_ratio, 3.0);
        assert_eq!(m.max_consecutive_losses, 2);
        assert_eq!(m.avg_hold_days, 3.0);
        assert_eq!(m.total_fees, dec!(4));
        assert_eq!(m.total_return_pct, 2.0);
    }

    #[test]
    fn test_drawdown_ignores_contributions() {
        let curve = vec![
            point(0, dec!(1000), dec!(1000)),
            point(1, dec!(900), dec!(1000)),
            // 500 deposited; underlying value unchanged
            point(2, dec!(1400), dec!(1500)),
        ];
        let m = BacktestMetrics::calculate(&[], &curve);
        assert!((m.max_drawdown_pct - 10.0).abs() < 1e-9);
        assert!((m.max_drawdown - 100.0).abs() < 1e-6);
        assert!(m.total_return_pct < 0.0);
    }

    #[test]
    fn test_empty_inputs_are_zero() {
        let m = BacktestMetrics::calculate(&[], &[]);
        assert_eq!(m, BacktestMetrics::default());
    }

    #[test]
    fn test_profit_factor_capped_without_losses() {
        let m = BacktestMetrics::calculate(&[trade(dec!(10), 1)], &[]);
        assert_eq!(m.profit_factor, 100.0);
    }
}
