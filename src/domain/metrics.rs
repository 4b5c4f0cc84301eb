//! Performance metrics over a raw execution log.
//!
//! Returns and drawdowns are fractions (0.10 = 10%). Ratios are annualized
//! with the bars-per-year of the run's timeframe and use the population
//! standard deviation of bar returns. Trade statistics count every trade in
//! the log, including a position still open at the last bar.

use serde::{Deserialize, Serialize};

use crate::domain::execution_result::{EquityPoint, RawExecutionLog, Trade};
use crate::domain::request::Timeframe;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub total_return: f64,
    pub annualized_return: f64,
    pub sharpe_ratio: f64,
    pub sortino_ratio: f64,
    pub max_drawdown: f64,
    /// Longest run of bars spent below a prior equity peak.
    pub max_drawdown_duration: usize,
    pub total_trades: usize,
    pub open_trades: usize,
    pub trades_won: usize,
    pub trades_lost: usize,
    pub trades_breakeven: usize,
    pub win_rate: f64,
    /// `None` when there are winning trades but no losing ones.
    pub profit_factor: Option<f64>,
    pub avg_win: f64,
    pub avg_loss: f64,
    pub largest_win: f64,
    pub largest_loss: f64,
    /// Mean holding time of closed trades, in days.
    pub avg_trade_duration: f64,
    pub sqn: f64,
    pub starting_value: f64,
    pub ending_value: f64,
    pub buy_and_hold_return: f64,
}

impl PerformanceMetrics {
    pub fn compute(
        log: &RawExecutionLog,
        initial_capital: f64,
        timeframe: Timeframe,
        risk_free_rate: f64,
    ) -> Self {
        let equity_curve = &log.equity_curve;
        let bars_per_year = timeframe.bars_per_year();

        let ending_value = log.ending_value().unwrap_or(initial_capital);
        let total_return = ratio_change(initial_capital, ending_value);

        let years = equity_curve.len() as f64 / bars_per_year;
        let annualized_return = if years > 0.0 && total_return > -1.0 && total_return.is_finite() {
            (1.0 + total_return).powf(1.0 / years) - 1.0
        } else {
            0.0
        };

        let (max_drawdown, max_drawdown_duration) = compute_drawdown(equity_curve);
        let (sharpe_ratio, sortino_ratio) =
            compute_risk_adjusted(equity_curve, risk_free_rate / bars_per_year, bars_per_year);

        let stats = TradeStats::collect(&log.trades);

        PerformanceMetrics {
            total_return,
            annualized_return,
            sharpe_ratio,
            sortino_ratio,
            max_drawdown,
            max_drawdown_duration,
            total_trades: log.trades.len(),
            open_trades: log.trades.iter().filter(|t| t.is_open()).count(),
            trades_won: stats.won,
            trades_lost: stats.lost,
            trades_breakeven: stats.breakeven,
            win_rate: stats.win_rate(),
            profit_factor: stats.profit_factor(),
            avg_win: mean_or_zero(stats.total_wins, stats.won),
            avg_loss: mean_or_zero(stats.total_losses, stats.lost),
            largest_win: stats.largest_win,
            largest_loss: stats.largest_loss,
            avg_trade_duration: stats.avg_duration_days(),
            sqn: compute_sqn(&log.trades),
            starting_value: initial_capital,
            ending_value,
            buy_and_hold_return: ratio_change(log.first_close, log.last_close),
        }
    }

    pub fn total_return_pct(&self) -> f64 {
        self.total_return * 100.0
    }

    pub fn max_drawdown_pct(&self) -> f64 {
        self.max_drawdown * 100.0
    }
}

fn ratio_change(from: f64, to: f64) -> f64 {
    if from > 0.0 {
        (to - from) / from
    } else {
        0.0
    }
}

fn mean_or_zero(total: f64, count: usize) -> f64 {
    if count > 0 {
        total / count as f64
    } else {
        0.0
    }
}

#[derive(Default)]
struct TradeStats {
    won: usize,
    lost: usize,
    breakeven: usize,
    total_wins: f64,
    total_losses: f64,
    largest_win: f64,
    largest_loss: f64,
    closed: usize,
    duration_days: i64,
}

impl TradeStats {
    fn collect(trades: &[Trade]) -> Self {
        let mut stats = TradeStats::default();
        for trade in trades {
            let pnl = trade.pnl;
            if pnl > 0.0 {
                stats.won += 1;
                stats.total_wins += pnl;
                stats.largest_win = stats.largest_win.max(pnl);
            } else if pnl < 0.0 {
                stats.lost += 1;
                stats.total_losses += pnl.abs();
                stats.largest_loss = stats.largest_loss.max(pnl.abs());
            } else {
                stats.breakeven += 1;
            }

            if let Some(exit_time) = trade.exit_time {
                stats.closed += 1;
                stats.duration_days += (exit_time - trade.entry_time).num_days();
            }
        }
        stats
    }

    fn win_rate(&self) -> f64 {
        let total = self.won + self.lost + self.breakeven;
        mean_or_zero(self.won as f64, total)
    }

    fn profit_factor(&self) -> Option<f64> {
        if self.total_losses > 0.0 {
            Some(self.total_wins / self.total_losses)
        } else if self.total_wins > 0.0 {
            None
        } else {
            Some(0.0)
        }
    }

    fn avg_duration_days(&self) -> f64 {
        mean_or_zero(self.duration_days as f64, self.closed)
    }
}

/// System quality number: sqrt(n) * mean(pnl) / sample stdev(pnl).
fn compute_sqn(trades: &[Trade]) -> f64 {
    let n = trades.len();
    if n < 2 {
        return 0.0;
    }
    let count = n as f64;
    let mean = trades.iter().map(|t| t.pnl).sum::<f64>() / count;
    let variance = trades.iter().map(|t| (t.pnl - mean).powi(2)).sum::<f64>() / (count - 1.0);
    let stddev = variance.sqrt();
    if stddev > 0.0 {
        count.sqrt() * mean / stddev
    } else {
        0.0
    }
}

fn compute_drawdown(equity_curve: &[EquityPoint]) -> (f64, usize) {
    let Some(first) = equity_curve.first() else {
        return (0.0, 0);
    };

    let mut peak = first.equity;
    let mut max_dd = 0.0_f64;
    let mut max_dd_duration = 0usize;
    let mut current_dd_duration = 0usize;

    for point in equity_curve {
        if point.equity >= peak {
            peak = point.equity;
            current_dd_duration = 0;
        } else if peak > 0.0 {
            max_dd = max_dd.max((peak - point.equity) / peak);
            current_dd_duration += 1;
            max_dd_duration = max_dd_duration.max(current_dd_duration);
        }
    }

    (max_dd, max_dd_duration)
}

fn compute_risk_adjusted(
    equity_curve: &[EquityPoint],
    bar_rf: f64,
    bars_per_year: f64,
) -> (f64, f64) {
    if equity_curve.len() < 2 {
        return (0.0, 0.0);
    }

    let returns: Vec<f64> = equity_curve
        .windows(2)
        .map(|w| ratio_change(w[0].equity, w[1].equity))
        .collect();

    let n = returns.len() as f64;
    let mean: f64 = returns.iter().sum::<f64>() / n;
    let variance: f64 = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / n;
    let stddev = variance.sqrt();
    let excess_return = mean - bar_rf;
    let annualize = bars_per_year.sqrt();

    let sharpe = if stddev > 0.0 {
        excess_return / stddev * annualize
    } else {
        0.0
    };

    let downside_sq: f64 = returns
        .iter()
        .filter(|&&r| r < bar_rf)
        .map(|&r| (r - bar_rf).powi(2))
        .sum();
    let downside_stddev = (downside_sq / n).sqrt();

    let sortino = if downside_stddev > 0.0 {
        excess_return / downside_stddev * annualize
    } else {
        0.0
    };

    (sharpe, sortino)
}
