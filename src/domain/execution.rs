//! Fill simulation: slippage, commissions, position sizing, entries, exits
//! and stop-loss / take-profit triggers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::execution_result::{Direction, ExitReason, Trade};
use crate::domain::portfolio::Portfolio;
use crate::domain::position::Position;
use crate::domain::program::{PositionSizing, RiskLimits};

/// Cost model and venue rules for a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionConfig {
    pub commission_per_trade: f64,
    pub commission_pct: f64,
    pub slippage_pct: f64,
    pub allow_shorting: bool,
    /// Trade fractional units instead of whole ones.
    #[serde(default)]
    pub fractional_units: bool,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        ExecutionConfig {
            commission_per_trade: 0.0,
            commission_pct: 0.1,
            slippage_pct: 0.0,
            allow_shorting: true,
            fractional_units: false,
        }
    }
}

/// Commission: flat_fee + (trade_value * pct / 100).
pub fn calculate_commission(trade_value: f64, config: &ExecutionConfig) -> f64 {
    config.commission_per_trade + (trade_value * config.commission_pct / 100.0)
}

/// Buys fill above the market, sells below it.
pub fn apply_slippage(market_price: f64, buying: bool, slippage_pct: f64) -> f64 {
    let sign = if buying { 1.0 } else { -1.0 };
    market_price * (1.0 + sign * slippage_pct / 100.0)
}

/// Units to trade at `price`, after the max-position and cash caps.
///
/// - fixed: the configured quantity
/// - percent of equity: equity * pct / price
/// - risk based: equity * risk% / per-unit risk, where per-unit risk is
///   ATR * multiple when an ATR is configured, else price * stop%
pub fn size_position(
    sizing: &PositionSizing,
    risk: &RiskLimits,
    equity: f64,
    cash: f64,
    price: f64,
    atr: Option<f64>,
    config: &ExecutionConfig,
) -> f64 {
    if price <= 0.0 || equity <= 0.0 {
        return 0.0;
    }

    let wanted = match sizing {
        PositionSizing::Fixed { quantity } => *quantity,
        PositionSizing::PercentEquity { percent } => equity * percent / 100.0 / price,
        PositionSizing::RiskBased {
            risk_pct,
            atr: atr_ref,
            atr_multiple,
        } => {
            let per_unit = match (atr_ref, atr) {
                (Some(_), Some(atr)) => Some(atr * atr_multiple),
                (Some(_), None) => None,
                (None, _) => risk.stop_loss_pct.map(|stop| price * stop / 100.0),
            };
            match per_unit.filter(|r| *r > 0.0) {
                Some(per_unit) => equity * risk_pct / 100.0 / per_unit,
                None => 0.0,
            }
        }
    };

    let max_by_position = equity * risk.max_position_pct / 100.0 / price;
    let max_by_cash = (cash - config.commission_per_trade).max(0.0)
        / (price * (1.0 + config.commission_pct / 100.0));
    let quantity = wanted.min(max_by_position).min(max_by_cash).max(0.0);

    if config.fractional_units {
        quantity
    } else {
        quantity.floor()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EntryResult {
    Entered {
        quantity: f64,
        execution_price: f64,
        commission: f64,
    },
    ShortingDisabled,
    InsufficientCapital,
}

/// Everything an entry needs to know about the bar it fills on.
#[derive(Debug, Clone, PartialEq)]
pub struct EntryOrder {
    pub direction: Direction,
    pub market_price: f64,
    pub time: DateTime<Utc>,
    /// ATR value at this bar, for risk-based sizing.
    pub atr: Option<f64>,
}

/// Open a position. Both sides escrow notional plus commission from cash.
pub fn enter_position(
    portfolio: &mut Portfolio,
    order: &EntryOrder,
    sizing: &PositionSizing,
    risk: &RiskLimits,
    config: &ExecutionConfig,
) -> EntryResult {
    if order.direction == Direction::Short && !config.allow_shorting {
        return EntryResult::ShortingDisabled;
    }

    let buying = order.direction == Direction::Long;
    let execution_price = apply_slippage(order.market_price, buying, config.slippage_pct);
    let equity = portfolio.equity(order.market_price);
    let quantity = size_position(
        sizing,
        risk,
        equity,
        portfolio.cash,
        execution_price,
        order.atr,
        config,
    );
    if quantity <= 0.0 {
        return EntryResult::InsufficientCapital;
    }

    let cost = quantity * execution_price;
    let commission = calculate_commission(cost, config);
    if cost + commission > portfolio.cash {
        return EntryResult::InsufficientCapital;
    }
    portfolio.cash -= cost + commission;

    // Levels sit on the losing / winning side of the fill for each direction.
    let sign = order.direction.sign();
    let stop_loss = risk
        .stop_loss_pct
        .map(|pct| execution_price * (1.0 - sign * pct / 100.0));
    let take_profit = risk
        .take_profit_pct
        .map(|pct| execution_price * (1.0 + sign * pct / 100.0));

    portfolio.position = Some(Position {
        direction: order.direction,
        quantity,
        entry_price: execution_price,
        entry_time: order.time,
        stop_loss,
        take_profit,
        entry_commission: commission,
    });

    EntryResult::Entered {
        quantity,
        execution_price,
        commission,
    }
}

/// Close the open position at `market_price`, recording the trade.
///
/// P&L includes both commissions. A long receives the sale proceeds; a short
/// gets back its escrow plus the price difference.
pub fn exit_position(
    portfolio: &mut Portfolio,
    market_price: f64,
    time: DateTime<Utc>,
    reason: ExitReason,
    config: &ExecutionConfig,
) -> Option<Trade> {
    let position = portfolio.position.take()?;

    let exit_price = apply_slippage(market_price, !position.is_long(), config.slippage_pct);
    let exit_commission = calculate_commission(position.quantity * exit_price, config);
    let pnl = position.unrealized_pnl(exit_price) - position.entry_commission - exit_commission;

    portfolio.cash += position.market_value(exit_price) - exit_commission;

    let trade = Trade {
        direction: position.direction,
        quantity: position.quantity,
        entry_time: position.entry_time,
        exit_time: Some(time),
        entry_price: position.entry_price,
        exit_price,
        pnl,
        commission: position.entry_commission + exit_commission,
        exit_reason: Some(reason),
    };
    portfolio.trades.push(trade.clone());
    Some(trade)
}

/// Exit on a stop-loss or take-profit hit at this bar's close.
pub fn check_triggers(
    portfolio: &mut Portfolio,
    close: f64,
    time: DateTime<Utc>,
    config: &ExecutionConfig,
) -> Option<Trade> {
    let reason = portfolio.position.as_ref()?.triggered_exit(close)?;
    exit_position(portfolio, close, time, reason, config)
}

/// Report a position still open at the last bar, marked to `last_close`.
pub fn record_open_position(portfolio: &mut Portfolio, last_close: f64) {
    let Some(position) = portfolio.position.as_ref() else {
        return;
    };
    let trade = Trade {
        direction: position.direction,
        quantity: position.quantity,
        entry_time: position.entry_time,
        exit_time: None,
        entry_price: position.entry_price,
        exit_price: last_close,
        pnl: position.unrealized_pnl(last_close) - position.entry_commission,
        commission: position.entry_commission,
        exit_reason: None,
    };
    portfolio.trades.push(trade);
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use chrono::TimeZone;

    fn t(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, day, 0, 0, 0).unwrap()
    }

    fn frictionless() -> ExecutionConfig {
        ExecutionConfig {
            commission_pct: 0.0,
            ..Default::default()
        }
    }

    fn all_in() -> PositionSizing {
        PositionSizing::PercentEquity { percent: 100.0 }
    }

    fn order(direction: Direction, price: f64) -> EntryOrder {
        EntryOrder {
            direction,
            market_price: price,
            time: t(2),
            atr: None,
        }
    }

    #[test]
    fn commission_is_flat_plus_percent() {
        let config = ExecutionConfig {
            commission_per_trade: 10.0,
            commission_pct: 0.1,
            ..Default::default()
        };
        assert_relative_eq!(calculate_commission(10_000.0, &config), 20.0);
    }

    #[test]
    fn slippage_direction() {
        assert_relative_eq!(apply_slippage(100.0, true, 0.05), 100.05, epsilon = 1e-9);
        assert_relative_eq!(apply_slippage(100.0, false, 0.05), 99.95, epsilon = 1e-9);
    }

    #[test]
    fn percent_sizing_floors_to_whole_units() {
        let q = size_position(
            &PositionSizing::PercentEquity { percent: 95.0 },
            &RiskLimits::default(),
            10_000.0,
            10_000.0,
            33.0,
            None,
            &frictionless(),
        );
        // 9500 / 33 = 287.87
        assert_relative_eq!(q, 287.0);
    }

    #[test]
    fn fractional_sizing_keeps_remainder() {
        let config = ExecutionConfig {
            fractional_units: true,
            ..frictionless()
        };
        let q = size_position(&all_in(), &RiskLimits::default(), 1_000.0, 1_000.0, 300.0, None, &config);
        assert_relative_eq!(q, 1_000.0 / 300.0);
    }

    #[test]
    fn risk_sizing_with_atr_and_stop() {
        let risk = RiskLimits {
            stop_loss_pct: Some(2.0),
            ..Default::default()
        };
        let by_stop = PositionSizing::RiskBased {
            risk_pct: 1.0,
            atr: None,
            atr_multiple: 1.0,
        };
        // risk 1000, per unit 100 * 2% = 2 -> 500 units, capped by 100% equity / 100 = 1000
        let q = size_position(&by_stop, &risk, 100_000.0, 100_000.0, 100.0, None, &frictionless());
        assert_relative_eq!(q, 500.0);

        let by_atr = PositionSizing::RiskBased {
            risk_pct: 1.0,
            atr: Some(crate::domain::rule::IndicatorRef::value(
                crate::domain::indicator::IndicatorType::Atr(14),
            )),
            atr_multiple: 2.0,
        };
        // per unit 2.5 * 2 = 5 -> 200 units
        let q = size_position(&by_atr, &risk, 100_000.0, 100_000.0, 100.0, Some(2.5), &frictionless());
        assert_relative_eq!(q, 200.0);
        // ATR not available yet -> no trade
        let q = size_position(&by_atr, &risk, 100_000.0, 100_000.0, 100.0, None, &frictionless());
        assert_relative_eq!(q, 0.0);
    }

    #[test]
    fn sizing_respects_max_position_and_cash() {
        let risk = RiskLimits {
            max_position_pct: 25.0,
            ..Default::default()
        };
        let q = size_position(&all_in(), &risk, 10_000.0, 10_000.0, 10.0, None, &frictionless());
        assert_relative_eq!(q, 250.0);

        let fixed = PositionSizing::Fixed { quantity: 1_000.0 };
        let q = size_position(&fixed, &RiskLimits::default(), 10_000.0, 500.0, 10.0, None, &frictionless());
        assert_relative_eq!(q, 50.0);
    }

    #[test]
    fn long_round_trip_with_costs() {
        let config = ExecutionConfig {
            commission_per_trade: 1.0,
            commission_pct: 0.0,
            ..Default::default()
        };
        let mut portfolio = Portfolio::new(1_001.0);
        let entered = enter_position(
            &mut portfolio,
            &order(Direction::Long, 10.0),
            &all_in(),
            &RiskLimits::default(),
            &config,
        );
        assert!(matches!(entered, EntryResult::Entered { quantity, .. } if quantity == 100.0));
        assert_relative_eq!(portfolio.cash, 0.0);

        let trade = exit_position(&mut portfolio, 12.0, t(3), ExitReason::Signal, &config).unwrap();
        assert_relative_eq!(trade.pnl, 200.0 - 2.0);
        assert_relative_eq!(trade.commission, 2.0);
        assert_relative_eq!(portfolio.cash, 1_199.0);
        assert!(!portfolio.has_position());
        assert_eq!(portfolio.trades.len(), 1);
    }

    #[test]
    fn short_round_trip_profits_on_decline() {
        let config = frictionless();
        let mut portfolio = Portfolio::new(1_000.0);
        enter_position(
            &mut portfolio,
            &order(Direction::Short, 10.0),
            &all_in(),
            &RiskLimits::default(),
            &config,
        );
        assert_relative_eq!(portfolio.cash, 0.0);
        assert_relative_eq!(portfolio.equity(8.0), 1_200.0);

        let trade = exit_position(&mut portfolio, 8.0, t(3), ExitReason::Signal, &config).unwrap();
        assert_eq!(trade.direction, Direction::Short);
        assert_relative_eq!(trade.pnl, 200.0);
        assert_relative_eq!(portfolio.cash, 1_200.0);
    }

    #[test]
    fn shorting_can_be_disabled() {
        let config = ExecutionConfig {
            allow_shorting: false,
            ..frictionless()
        };
        let mut portfolio = Portfolio::new(1_000.0);
        let result = enter_position(
            &mut portfolio,
            &order(Direction::Short, 10.0),
            &all_in(),
            &RiskLimits::default(),
            &config,
        );
        assert_eq!(result, EntryResult::ShortingDisabled);
        assert!(!portfolio.has_position());
    }

    #[test]
    fn price_above_capital_is_insufficient() {
        let mut portfolio = Portfolio::new(50.0);
        let result = enter_position(
            &mut portfolio,
            &order(Direction::Long, 100.0),
            &all_in(),
            &RiskLimits::default(),
            &frictionless(),
        );
        assert_eq!(result, EntryResult::InsufficientCapital);
    }

    #[test]
    fn triggers_use_levels_from_fill() {
        let config = frictionless();
        let risk = RiskLimits {
            stop_loss_pct: Some(5.0),
            take_profit_pct: Some(10.0),
            ..Default::default()
        };
        let mut portfolio = Portfolio::new(1_000.0);
        enter_position(&mut portfolio, &order(Direction::Long, 100.0), &all_in(), &risk, &config);

        assert!(check_triggers(&mut portfolio, 97.0, t(3), &config).is_none());
        let trade = check_triggers(&mut portfolio, 94.0, t(4), &config).unwrap();
        assert_eq!(trade.exit_reason, Some(ExitReason::StopLoss));

        enter_position(&mut portfolio, &order(Direction::Short, 100.0), &all_in(), &risk, &config);
        let trade = check_triggers(&mut portfolio, 89.0, t(5), &config).unwrap();
        assert_eq!(trade.exit_reason, Some(ExitReason::TakeProfit));
    }

    #[test]
    fn open_position_is_marked_to_last_close() {
        let config = frictionless();
        let mut portfolio = Portfolio::new(1_000.0);
        enter_position(&mut portfolio, &order(Direction::Long, 10.0), &all_in(), &RiskLimits::default(), &config);
        record_open_position(&mut portfolio, 11.0);

        let trade = &portfolio.trades[0];
        assert!(trade.is_open());
        assert_relative_eq!(trade.exit_price, 11.0);
        assert_relative_eq!(trade.pnl, 100.0);
    }
}
