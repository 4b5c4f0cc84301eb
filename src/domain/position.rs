//! The single open position of a run.

use chrono::{DateTime, Utc};

use crate::domain::execution_result::{Direction, ExitReason};

#[derive(Debug, Clone, PartialEq)]
pub struct Position {
    pub direction: Direction,
    /// Always positive; the side is carried by `direction`.
    pub quantity: f64,
    pub entry_price: f64,
    pub entry_time: DateTime<Utc>,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub entry_commission: f64,
}

impl Position {
    pub fn is_long(&self) -> bool {
        self.direction == Direction::Long
    }

    /// Value the position contributes to equity at `price`.
    ///
    /// A short escrows its entry notional, so it is worth that notional plus
    /// the price gain: `q * (2 * entry - price)`.
    pub fn market_value(&self, price: f64) -> f64 {
        match self.direction {
            Direction::Long => self.quantity * price,
            Direction::Short => self.quantity * (2.0 * self.entry_price - price),
        }
    }

    pub fn unrealized_pnl(&self, price: f64) -> f64 {
        self.direction.sign() * self.quantity * (price - self.entry_price)
    }

    /// Protective exit hit at `price`, stop-loss first.
    pub fn triggered_exit(&self, price: f64) -> Option<ExitReason> {
        let long = self.is_long();
        if let Some(stop) = self.stop_loss {
            if (long && price <= stop) || (!long && price >= stop) {
                return Some(ExitReason::StopLoss);
            }
        }
        if let Some(target) = self.take_profit {
            if (long && price >= target) || (!long && price <= target) {
                return Some(ExitReason::TakeProfit);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use chrono::TimeZone;

    fn position(direction: Direction) -> Position {
        let (stop, target) = match direction {
            Direction::Long => (45.0, 60.0),
            Direction::Short => (55.0, 40.0),
        };
        Position {
            direction,
            quantity: 100.0,
            entry_price: 50.0,
            entry_time: Utc.with_ymd_and_hms(2024, 1, 15, 0, 0, 0).unwrap(),
            stop_loss: Some(stop),
            take_profit: Some(target),
            entry_commission: 0.0,
        }
    }

    #[test]
    fn long_value_and_pnl() {
        let pos = position(Direction::Long);
        assert_relative_eq!(pos.market_value(55.0), 5500.0);
        assert_relative_eq!(pos.unrealized_pnl(55.0), 500.0);
    }

    #[test]
    fn short_value_gains_when_price_falls() {
        let pos = position(Direction::Short);
        assert_relative_eq!(pos.market_value(50.0), 5000.0);
        assert_relative_eq!(pos.market_value(45.0), 5500.0);
        assert_relative_eq!(pos.unrealized_pnl(45.0), 500.0);
        assert_relative_eq!(pos.unrealized_pnl(52.0), -200.0);
    }

    #[test]
    fn long_triggers() {
        let pos = position(Direction::Long);
        assert_eq!(pos.triggered_exit(45.0), Some(ExitReason::StopLoss));
        assert_eq!(pos.triggered_exit(60.5), Some(ExitReason::TakeProfit));
        assert_eq!(pos.triggered_exit(50.0), None);
    }

    #[test]
    fn short_triggers_are_mirrored() {
        let pos = position(Direction::Short);
        assert_eq!(pos.triggered_exit(55.0), Some(ExitReason::StopLoss));
        assert_eq!(pos.triggered_exit(39.0), Some(ExitReason::TakeProfit));
        assert_eq!(pos.triggered_exit(50.0), None);
    }

    #[test]
    fn no_levels_never_trigger() {
        let mut pos = position(Direction::Long);
        pos.stop_loss = None;
        pos.take_profit = None;
        assert_eq!(pos.triggered_exit(0.01), None);
        assert_eq!(pos.triggered_exit(1e9), None);
    }
}
