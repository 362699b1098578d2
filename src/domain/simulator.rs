//! Single-instrument fill simulation for strategy scripts.
//!
//! Follows a per-bar signal series (positive = long, negative = short,
//! zero = flat), filling at the bar's close with slippage and commission,
//! and exiting early on stop-loss or take-profit. After a protective exit
//! the simulator stays flat until the signal changes.

use super::outcome::{TradeRecord, TradeSide};

#[derive(Debug, Clone, PartialEq)]
pub struct SimulationConfig {
    pub initial_capital: f64,
    /// Fraction of available cash committed per entry.
    pub position_size: f64,
    pub commission_per_trade: f64,
    pub commission_pct: f64,
    pub slippage_pct: f64,
    /// Zero disables.
    pub stop_loss_pct: f64,
    /// Zero disables.
    pub take_profit_pct: f64,
    pub allow_shorting: bool,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        SimulationConfig {
            initial_capital: 100_000.0,
            position_size: 1.0,
            commission_per_trade: 0.0,
            commission_pct: 0.0,
            slippage_pct: 0.0,
            stop_loss_pct: 0.0,
            take_profit_pct: 0.0,
            allow_shorting: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SimulationResult {
    pub trades: Vec<TradeRecord>,
    /// Mark-to-market equity at each bar's close.
    pub equity: Vec<f64>,
}

/// Commission: flat fee + (trade_value * pct / 100).
pub fn calculate_commission(trade_value: f64, config: &SimulationConfig) -> f64 {
    config.commission_per_trade + trade_value * config.commission_pct / 100.0
}

/// Buying pays up, selling receives less.
fn slipped(price: f64, side: TradeSide, entering: bool, slippage_pct: f64) -> f64 {
    let buying = matches!(
        (side, entering),
        (TradeSide::Long, true) | (TradeSide::Short, false)
    );
    if buying {
        price * (1.0 + slippage_pct / 100.0)
    } else {
        price * (1.0 - slippage_pct / 100.0)
    }
}

#[derive(Debug, Clone)]
struct OpenPosition {
    side: TradeSide,
    quantity: f64,
    entry_price: f64,
    entry_index: usize,
    entry_commission: f64,
    stop_loss: Option<f64>,
    take_profit: Option<f64>,
}

impl OpenPosition {
    fn should_stop_loss(&self, price: f64) -> bool {
        match (self.stop_loss, self.side) {
            (Some(level), TradeSide::Long) => price <= level,
            (Some(level), TradeSide::Short) => price >= level,
            (None, _) => false,
        }
    }

    fn should_take_profit(&self, price: f64) -> bool {
        match (self.take_profit, self.side) {
            (Some(level), TradeSide::Long) => price >= level,
            (Some(level), TradeSide::Short) => price <= level,
            (None, _) => false,
        }
    }

    /// Cash value of the position at `price`. Shorts hold their entry
    /// notional in escrow, so they are worth escrow plus unrealized PnL.
    fn value_at(&self, price: f64) -> f64 {
        match self.side {
            TradeSide::Long => self.quantity * price,
            TradeSide::Short => self.quantity * (2.0 * self.entry_price - price),
        }
    }
}

struct Book<'a> {
    config: &'a SimulationConfig,
    cash: f64,
    position: Option<OpenPosition>,
    trades: Vec<TradeRecord>,
}

impl Book<'_> {
    fn enter(&mut self, side: TradeSide, market_price: f64, index: usize) {
        let config = self.config;
        let execution_price = slipped(market_price, side, true, config.slippage_pct);
        if !(execution_price.is_finite() && execution_price > 0.0) {
            return;
        }

        // Size so that the position plus its entry commission fits the budget.
        let budget = self.cash * config.position_size - config.commission_per_trade;
        let unit_cost = execution_price * (1.0 + config.commission_pct / 100.0);
        let quantity = (budget / unit_cost).floor();
        if quantity < 1.0 {
            return;
        }
        let cost = quantity * execution_price;
        let commission = calculate_commission(cost, config);
        if cost + commission > self.cash {
            return;
        }
        self.cash -= cost + commission;

        let sign = match side {
            TradeSide::Long => 1.0,
            TradeSide::Short => -1.0,
        };
        let stop_loss = (config.stop_loss_pct > 0.0)
            .then(|| execution_price * (1.0 - sign * config.stop_loss_pct / 100.0));
        let take_profit = (config.take_profit_pct > 0.0)
            .then(|| execution_price * (1.0 + sign * config.take_profit_pct / 100.0));

        self.position = Some(OpenPosition {
            side,
            quantity,
            entry_price: execution_price,
            entry_index: index,
            entry_commission: commission,
            stop_loss,
            take_profit,
        });
    }

    fn exit(&mut self, market_price: f64, index: usize) {
        let Some(position) = self.position.take() else {
            return;
        };
        let exit_price = slipped(market_price, position.side, false, self.config.slippage_pct);
        let exit_value = position.quantity * exit_price;
        let exit_commission = calculate_commission(exit_value, self.config);

        let price_pnl = match position.side {
            TradeSide::Long => position.quantity * (exit_price - position.entry_price),
            TradeSide::Short => position.quantity * (position.entry_price - exit_price),
        };
        let pnl = price_pnl - position.entry_commission - exit_commission;

        self.cash += match position.side {
            TradeSide::Long => exit_value - exit_commission,
            TradeSide::Short => {
                let entry_notional = position.quantity * position.entry_price;
                entry_notional + (entry_notional - exit_value) - exit_commission
            }
        };

        self.trades.push(TradeRecord {
            pnl,
            side: Some(position.side),
            entry_index: Some(position.entry_index),
            exit_index: Some(index),
            entry_price: Some(position.entry_price),
            exit_price: Some(exit_price),
            quantity: Some(position.quantity),
        });
    }

    fn equity(&self, price: f64) -> f64 {
        self.cash + self.position.as_ref().map_or(0.0, |p| p.value_at(price))
    }
}

fn desired_side(signal: f64, allow_shorting: bool) -> Option<TradeSide> {
    if signal > 0.0 {
        Some(TradeSide::Long)
    } else if signal < 0.0 && allow_shorting {
        Some(TradeSide::Short)
    } else {
        None
    }
}

/// Run the signal series against `close`. Extra points in the longer input
/// are ignored; any open position is closed at the last bar.
pub fn simulate(close: &[f64], signals: &[f64], config: &SimulationConfig) -> SimulationResult {
    let len = close.len().min(signals.len());
    let mut book = Book {
        config,
        cash: config.initial_capital,
        position: None,
        trades: Vec::new(),
    };
    let mut equity = Vec::with_capacity(len);
    let mut blocked: Option<Option<TradeSide>> = None;

    for i in 0..len {
        let price = close[i];
        let desired = desired_side(signals[i], config.allow_shorting);

        if blocked.is_some_and(|b| b != desired) {
            blocked = None;
        }

        if let Some(position) = &book.position {
            if position.should_stop_loss(price) || position.should_take_profit(price) {
                book.exit(price, i);
                blocked = Some(desired);
            }
        }

        let current = book.position.as_ref().map(|p| p.side);
        if current != desired {
            book.exit(price, i);
            if let Some(side) = desired {
                if blocked.is_none() {
                    book.enter(side, price, i);
                }
            }
        }

        equity.push(book.equity(price));
    }

    if len > 0 && book.position.is_some() {
        let last = len - 1;
        book.exit(close[last], last);
        equity[last] = book.equity(close[last]);
    }

    SimulationResult {
        trades: book.trades,
        equity,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SimulationConfig {
        SimulationConfig {
            initial_capital: 1_000.0,
            ..SimulationConfig::default()
        }
    }

    #[test]
    fn long_round_trip_without_costs() {
        let result = simulate(&[10.0, 12.0, 15.0], &[1.0, 1.0, 0.0], &config());
        assert_eq!(result.trades.len(), 1);
        let trade = &result.trades[0];
        // 100 shares bought at 10, sold at 15
        assert_eq!(trade.quantity, Some(100.0));
        assert!((trade.pnl - 500.0).abs() < 1e-9);
        assert_eq!(trade.entry_index, Some(0));
        assert_eq!(trade.exit_index, Some(2));
        assert_eq!(result.equity, vec![1_000.0, 1_200.0, 1_500.0]);
    }

    #[test]
    fn short_profits_from_falling_price() {
        let result = simulate(&[20.0, 15.0, 10.0], &[-1.0, -1.0, 0.0], &config());
        assert_eq!(result.trades.len(), 1);
        assert_eq!(result.trades[0].side, Some(TradeSide::Short));
        // 50 shares shorted at 20, covered at 10
        assert!((result.trades[0].pnl - 500.0).abs() < 1e-9);
        assert!((result.equity[1] - 1_250.0).abs() < 1e-9);
        assert!((result.equity[2] - 1_500.0).abs() < 1e-9);
    }

    #[test]
    fn shorting_disabled_treats_negative_as_flat() {
        let cfg = SimulationConfig {
            allow_shorting: false,
            ..config()
        };
        let result = simulate(&[20.0, 15.0], &[-1.0, -1.0], &cfg);
        assert!(result.trades.is_empty());
        assert_eq!(result.equity, vec![1_000.0, 1_000.0]);
    }

    #[test]
    fn commission_and_slippage_reduce_pnl() {
        let cfg = SimulationConfig {
            commission_per_trade: 5.0,
            slippage_pct: 1.0,
            ..config()
        };
        let result = simulate(&[10.0, 10.0], &[1.0, 0.0], &cfg);
        let trade = &result.trades[0];
        // entry 10.1, 98 shares (98*10.1 + 5 <= 1000), exit 9.9
        assert_eq!(trade.quantity, Some(98.0));
        let expected = 98.0 * (9.9 - 10.1) - 10.0;
        assert!((trade.pnl - expected).abs() < 1e-6);
    }

    #[test]
    fn stop_loss_exits_and_waits_for_signal_change() {
        let cfg = SimulationConfig {
            stop_loss_pct: 10.0,
            ..config()
        };
        let close = [10.0, 8.5, 9.0, 9.5, 10.0];
        let signals = [1.0, 1.0, 1.0, 0.0, 1.0];
        let result = simulate(&close, &signals, &cfg);
        assert_eq!(result.trades.len(), 2);
        assert_eq!(result.trades[0].exit_index, Some(1));
        assert!(result.trades[0].pnl < 0.0);
        // no re-entry on bar 2, re-entry on bar 4 after the signal went flat
        assert_eq!(result.trades[1].entry_index, Some(4));
    }

    #[test]
    fn take_profit_exits_long() {
        let cfg = SimulationConfig {
            take_profit_pct: 20.0,
            ..config()
        };
        let result = simulate(&[10.0, 12.5, 13.0], &[1.0, 1.0, 1.0], &cfg);
        assert_eq!(result.trades.len(), 1);
        assert_eq!(result.trades[0].exit_index, Some(1));
        assert!((result.trades[0].pnl - 250.0).abs() < 1e-9);
    }

    #[test]
    fn reversal_closes_then_opens_opposite_side() {
        let result = simulate(&[10.0, 11.0, 9.0], &[1.0, -1.0, -1.0], &config());
        assert_eq!(result.trades.len(), 2);
        assert_eq!(result.trades[0].side, Some(TradeSide::Long));
        assert_eq!(result.trades[1].side, Some(TradeSide::Short));
        assert_eq!(result.trades[1].entry_index, Some(1));
    }

    #[test]
    fn insufficient_capital_skips_entry() {
        let result = simulate(&[5_000.0, 5_100.0], &[1.0, 1.0], &config());
        assert!(result.trades.is_empty());
    }

    #[test]
    fn mismatched_lengths_use_shorter_input() {
        let result = simulate(&[10.0, 11.0, 12.0], &[1.0], &config());
        assert_eq!(result.equity.len(), 1);
        assert_eq!(result.trades.len(), 1);
        assert_eq!(result.trades[0].exit_index, Some(0));
    }
}
