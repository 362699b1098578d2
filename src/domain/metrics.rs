//! Performance metrics over the trades and equity curve of one execution.

use serde::Serialize;

use super::outcome::ExecutionOutcome;

/// Profit factor reported when a strategy has gross profit but no losing
/// trades. Serialized as `null` with `profit_factor_unbounded = true`.
pub const PROFIT_FACTOR_NO_LOSSES: f64 = f64::INFINITY;

#[derive(Debug, Clone, PartialEq)]
pub struct MetricsConfig {
    /// Annual rate, spread evenly over `periods_per_year`.
    pub risk_free_rate: f64,
    pub periods_per_year: u32,
    /// Starting equity when the curve has to be rebuilt from trade PnL.
    pub initial_capital: f64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        MetricsConfig {
            risk_free_rate: 0.0,
            periods_per_year: 252,
            initial_capital: 100_000.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PerformanceMetrics {
    pub trade_count: usize,
    pub trades_won: usize,
    pub trades_lost: usize,
    pub trades_breakeven: usize,
    pub win_rate: f64,
    pub profit_factor: f64,
    pub profit_factor_unbounded: bool,
    pub sharpe_ratio: f64,
    pub sortino_ratio: f64,
    pub max_drawdown: f64,
    /// Longest run of consecutive points below the running peak.
    pub max_drawdown_duration: usize,
    pub total_return: f64,
    pub annualized_return: f64,
    pub final_equity: f64,
    pub avg_win: f64,
    pub avg_loss: f64,
    pub largest_win: f64,
    pub largest_loss: f64,
    /// Mean bars held, over trades that report entry and exit indices.
    pub avg_trade_duration: f64,
}

impl PerformanceMetrics {
    pub fn compute(outcome: &ExecutionOutcome, config: &MetricsConfig) -> Self {
        let trades = &outcome.trade_records;
        let equity = equity_series(outcome, config.initial_capital);
        let periods = f64::from(config.periods_per_year.max(1));

        let first_equity = equity.first().copied().unwrap_or(config.initial_capital);
        let final_equity = equity.last().copied().unwrap_or(config.initial_capital);
        let total_return = if first_equity > 0.0 {
            (final_equity - first_equity) / first_equity
        } else {
            0.0
        };

        let years = equity.len().saturating_sub(1) as f64 / periods;
        let annualized_return = if years > 0.0 && total_return > -1.0 && total_return.is_finite() {
            (1.0 + total_return).powf(1.0 / years) - 1.0
        } else {
            0.0
        };

        let (max_drawdown, max_drawdown_duration) = compute_drawdown(&equity);
        let (sharpe_ratio, sortino_ratio) =
            compute_risk_adjusted(&equity, config.risk_free_rate / periods, periods);

        let mut trades_won = 0usize;
        let mut trades_lost = 0usize;
        let mut trades_breakeven = 0usize;
        let mut gross_profit = 0.0_f64;
        let mut gross_loss = 0.0_f64;
        let mut largest_win = 0.0_f64;
        let mut largest_loss = 0.0_f64;
        let mut held_bars = 0usize;
        let mut timed_trades = 0usize;

        for trade in trades {
            let pnl = trade.pnl;
            if pnl > 0.0 {
                trades_won += 1;
                gross_profit += pnl;
                largest_win = largest_win.max(pnl);
            } else if pnl < 0.0 {
                trades_lost += 1;
                gross_loss += pnl.abs();
                largest_loss = largest_loss.max(pnl.abs());
            } else {
                trades_breakeven += 1;
            }

            if let (Some(entry), Some(exit)) = (trade.entry_index, trade.exit_index) {
                held_bars += exit.saturating_sub(entry);
                timed_trades += 1;
            }
        }

        let trade_count = trades.len();
        let win_rate = if trade_count > 0 {
            trades_won as f64 / trade_count as f64
        } else {
            0.0
        };
        let profit_factor = profit_factor(gross_profit, gross_loss);

        PerformanceMetrics {
            trade_count,
            trades_won,
            trades_lost,
            trades_breakeven,
            win_rate,
            profit_factor,
            profit_factor_unbounded: profit_factor.is_infinite(),
            sharpe_ratio,
            sortino_ratio,
            max_drawdown,
            max_drawdown_duration,
            total_return,
            annualized_return,
            final_equity,
            avg_win: if trades_won > 0 { gross_profit / trades_won as f64 } else { 0.0 },
            avg_loss: if trades_lost > 0 { gross_loss / trades_lost as f64 } else { 0.0 },
            largest_win,
            largest_loss,
            avg_trade_duration: if timed_trades > 0 {
                held_bars as f64 / timed_trades as f64
            } else {
                0.0
            },
        }
    }
}

/// Gross profit over gross loss (both non-negative).
pub fn profit_factor(gross_profit: f64, gross_loss: f64) -> f64 {
    if gross_loss > 0.0 {
        gross_profit / gross_loss
    } else if gross_profit > 0.0 {
        PROFIT_FACTOR_NO_LOSSES
    } else {
        0.0
    }
}

/// The curve the ratios are computed on: the script's own when it has at
/// least two points, otherwise cumulative trade PnL from `initial_capital`.
fn equity_series(outcome: &ExecutionOutcome, initial_capital: f64) -> Vec<f64> {
    if outcome.equity_curve.len() >= 2 {
        return outcome.equity_curve.iter().map(|p| p.equity).collect();
    }
    let mut equity = Vec::with_capacity(outcome.trade_records.len() + 1);
    let mut running = initial_capital;
    equity.push(running);
    for trade in &outcome.trade_records {
        running += trade.pnl;
        equity.push(running);
    }
    equity
}

fn compute_drawdown(equity: &[f64]) -> (f64, usize) {
    let Some(&first) = equity.first() else {
        return (0.0, 0);
    };

    let mut peak = first;
    let mut max_dd = 0.0_f64;
    let mut max_duration = 0usize;
    let mut current_duration = 0usize;

    for &value in equity {
        if value >= peak {
            peak = value;
            current_duration = 0;
        } else if peak > 0.0 {
            max_dd = max_dd.max((peak - value) / peak);
            current_duration += 1;
            max_duration = max_duration.max(current_duration);
        }
    }

    (max_dd, max_duration)
}

fn compute_risk_adjusted(equity: &[f64], period_rf: f64, periods_per_year: f64) -> (f64, f64) {
    if equity.len() < 2 {
        return (0.0, 0.0);
    }

    let returns: Vec<f64> = equity
        .windows(2)
        .map(|w| if w[0] > 0.0 { (w[1] - w[0]) / w[0] } else { 0.0 })
        .collect();

    let n = returns.len() as f64;
    let mean = returns.iter().sum::<f64>() / n;
    let stddev = (returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / n).sqrt();
    let excess_return = mean - period_rf;
    let annualize = periods_per_year.sqrt();

    let sharpe = if stddev > 0.0 {
        excess_return / stddev * annualize
    } else {
        0.0
    };

    let downside_sq: f64 = returns
        .iter()
        .filter(|&&r| r < period_rf)
        .map(|&r| (r - period_rf).powi(2))
        .sum();
    let downside_stddev = (downside_sq / n).sqrt();
    let sortino = if downside_stddev > 0.0 {
        excess_return / downside_stddev * annualize
    } else {
        0.0
    };

    (sharpe, sortino)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::outcome::{EquityPoint, ExecutionTiming, TradeRecord};
    use approx::assert_relative_eq;
    use std::time::Instant;

    fn outcome(pnls: &[f64], equity: &[f64]) -> ExecutionOutcome {
        let now = Instant::now();
        ExecutionOutcome {
            trade_records: pnls.iter().map(|&p| TradeRecord::from_pnl(p)).collect(),
            equity_curve: equity
                .iter()
                .enumerate()
                .map(|(index, &equity)| EquityPoint {
                    index,
                    date: None,
                    equity,
                })
                .collect(),
            raised_error: None,
            logs: Vec::new(),
            limits_enforced: true,
            timing: ExecutionTiming::between(now, now),
        }
    }

    #[test]
    fn trade_statistics_for_mixed_trades() {
        let m = PerformanceMetrics::compute(&outcome(&[10.0, -4.0, 6.0], &[]), &MetricsConfig::default());
        assert_eq!(m.trade_count, 3);
        assert_eq!(m.trades_won, 2);
        assert_eq!(m.trades_lost, 1);
        assert_relative_eq!(m.win_rate, 2.0 / 3.0);
        assert_relative_eq!(m.profit_factor, 4.0);
        assert!(!m.profit_factor_unbounded);
        assert_relative_eq!(m.avg_win, 8.0);
        assert_relative_eq!(m.avg_loss, 4.0);
        assert_relative_eq!(m.largest_win, 10.0);
        assert_relative_eq!(m.largest_loss, 4.0);
    }

    #[test]
    fn profit_factor_without_losses_is_the_sentinel() {
        for _ in 0..3 {
            let m = PerformanceMetrics::compute(&outcome(&[5.0, 7.0], &[]), &MetricsConfig::default());
            assert_eq!(m.profit_factor, PROFIT_FACTOR_NO_LOSSES);
            assert!(m.profit_factor_unbounded);
        }
        assert_eq!(profit_factor(0.0, 0.0), 0.0);
        assert_eq!(profit_factor(3.0, 0.0), f64::INFINITY);
    }

    #[test]
    fn unbounded_profit_factor_serializes_as_null() {
        let m = PerformanceMetrics::compute(&outcome(&[5.0], &[]), &MetricsConfig::default());
        let json = serde_json::to_value(&m).unwrap();
        assert!(json["profit_factor"].is_null());
        assert_eq!(json["profit_factor_unbounded"], true);
    }

    #[test]
    fn breakeven_trades_count_but_do_not_win() {
        let m = PerformanceMetrics::compute(&outcome(&[0.0, 2.0], &[]), &MetricsConfig::default());
        assert_eq!(m.trades_breakeven, 1);
        assert_relative_eq!(m.win_rate, 0.5);
    }

    #[test]
    fn drawdown_is_fraction_of_peak() {
        let m = PerformanceMetrics::compute(
            &outcome(&[1.0], &[100.0, 120.0, 90.0, 95.0, 130.0]),
            &MetricsConfig::default(),
        );
        assert_relative_eq!(m.max_drawdown, 0.25);
        assert_eq!(m.max_drawdown_duration, 2);
        assert_relative_eq!(m.total_return, 0.3);
        assert_relative_eq!(m.final_equity, 130.0);
    }

    #[test]
    fn short_curve_is_rebuilt_from_trades() {
        let config = MetricsConfig {
            initial_capital: 1_000.0,
            ..MetricsConfig::default()
        };
        let m = PerformanceMetrics::compute(&outcome(&[100.0, -550.0], &[1_000.0]), &config);
        // 1000 -> 1100 -> 550
        assert_relative_eq!(m.final_equity, 550.0);
        assert_relative_eq!(m.max_drawdown, 0.5);
        assert_relative_eq!(m.total_return, -0.45);
    }

    #[test]
    fn sharpe_uses_population_stdev_and_annualizes() {
        // returns: +10%, -10%
        let m = PerformanceMetrics::compute(
            &outcome(&[1.0], &[100.0, 110.0, 99.0]),
            &MetricsConfig::default(),
        );
        // mean 0, so Sharpe is 0
        assert_relative_eq!(m.sharpe_ratio, 0.0, epsilon = 1e-12);

        let m = PerformanceMetrics::compute(
            &outcome(&[1.0], &[100.0, 110.0, 132.0]),
            &MetricsConfig::default(),
        );
        // returns 0.1 and 0.2: mean 0.15, pstdev 0.05
        assert_relative_eq!(m.sharpe_ratio, 3.0 * 252f64.sqrt(), epsilon = 1e-9);
    }

    #[test]
    fn risk_free_rate_is_spread_per_period() {
        let config = MetricsConfig {
            risk_free_rate: 0.252,
            periods_per_year: 252,
            ..MetricsConfig::default()
        };
        let m = PerformanceMetrics::compute(&outcome(&[1.0], &[100.0, 110.0, 132.0]), &config);
        // per-period rf 0.001
        assert_relative_eq!(m.sharpe_ratio, (0.149 / 0.05) * 252f64.sqrt(), epsilon = 1e-9);
    }

    #[test]
    fn sortino_ignores_upside_volatility() {
        let m = PerformanceMetrics::compute(
            &outcome(&[1.0], &[100.0, 110.0, 132.0]),
            &MetricsConfig::default(),
        );
        assert_eq!(m.sortino_ratio, 0.0);
    }

    #[test]
    fn average_duration_uses_indexed_trades() {
        let mut o = outcome(&[1.0, 2.0], &[]);
        o.trade_records[0].entry_index = Some(2);
        o.trade_records[0].exit_index = Some(6);
        let m = PerformanceMetrics::compute(&o, &MetricsConfig::default());
        assert_relative_eq!(m.avg_trade_duration, 4.0);
    }
}
