//! Bar-by-bar backtest loop over a single series.
//!
//! Per bar, in order: protective triggers on the close, exit signals, entry
//! signals (long before short). Signals are only evaluated once every
//! indicator the program uses has produced its first value. No position is
//! opened on the bar that closed one.

use std::collections::HashMap;

use crate::domain::error::EngineError;
use crate::domain::execution::{
    check_triggers, enter_position, exit_position, record_open_position, EntryOrder,
    EntryResult, ExecutionConfig,
};
use crate::domain::execution_result::{Direction, ExitReason, RawExecutionLog};
use crate::domain::indicator::{compute_indicators, IndicatorSeries, IndicatorType};
use crate::domain::ohlcv::{Bar, MarketSeries};
use crate::domain::portfolio::Portfolio;
use crate::domain::program::{PositionSizing, StrategyProgram};
use crate::domain::rule::{Operand, Rule};
use crate::domain::rule_eval::{evaluate, resolve_operand};

pub const MIN_BARS: usize = 2;

/// Run `program` over `series` starting from `initial_capital`.
pub fn run(
    program: &StrategyProgram,
    series: &MarketSeries,
    initial_capital: f64,
    config: &ExecutionConfig,
) -> Result<RawExecutionLog, EngineError> {
    let bars = &series.bars;
    if bars.len() < MIN_BARS {
        return Err(EngineError::InsufficientData {
            bars: bars.len(),
            minimum: MIN_BARS,
        });
    }

    let needed = program.indicators();
    let indicators = compute_indicators(bars, &needed);
    let warmup = warmup_index(&indicators, bars.len())?;
    tracing::debug!(
        indicators = needed.len(),
        warmup,
        bars = bars.len(),
        "engine start"
    );

    let mut portfolio = Portfolio::new(initial_capital);

    for (idx, bar) in bars.iter().enumerate() {
        let mut exited = check_triggers(&mut portfolio, bar.close, bar.timestamp, config).is_some();

        if idx >= warmup {
            let fires = |rule: &Option<Rule>| {
                rule.as_ref()
                    .is_some_and(|r| evaluate(r, bars, &indicators, idx))
            };

            if let Some(direction) = portfolio.position.as_ref().map(|p| p.direction) {
                let exit_rule = match direction {
                    Direction::Long => &program.exit_long,
                    Direction::Short => &program.exit_short,
                };
                if fires(exit_rule) {
                    exited |= exit_position(
                        &mut portfolio,
                        bar.close,
                        bar.timestamp,
                        ExitReason::Signal,
                        config,
                    )
                    .is_some();
                }
            }

            if !portfolio.has_position() && !exited {
                let direction = if fires(&program.entry_long) {
                    Some(Direction::Long)
                } else if config.allow_shorting && fires(&program.entry_short) {
                    Some(Direction::Short)
                } else {
                    None
                };

                if let Some(direction) = direction {
                    let order = EntryOrder {
                        direction,
                        market_price: bar.close,
                        time: bar.timestamp,
                        atr: sizing_atr(&program.sizing, bars, &indicators, idx),
                    };
                    let result =
                        enter_position(&mut portfolio, &order, &program.sizing, &program.risk, config);
                    if let EntryResult::Entered { quantity, execution_price, .. } = result {
                        tracing::trace!(?direction, quantity, execution_price, idx, "entered");
                    }
                }
            }
        }

        let equity = portfolio.equity(bar.close);
        if !equity.is_finite() {
            return Err(EngineError::NonFiniteEquity {
                timestamp: bar.timestamp.to_rfc3339(),
            });
        }
        portfolio.record_equity(bar.timestamp, equity);
    }

    let last_close = series.last_close().unwrap_or_default();
    record_open_position(&mut portfolio, last_close);

    Ok(RawExecutionLog {
        trades: portfolio.trades,
        equity_curve: portfolio.equity_curve,
        bars_processed: bars.len(),
        first_close: series.first_close().unwrap_or_default(),
        last_close,
    })
}

/// First bar at which every indicator has a value.
fn warmup_index(
    indicators: &HashMap<IndicatorType, IndicatorSeries>,
    bars: usize,
) -> Result<usize, EngineError> {
    let mut warmup = 0;
    // Sorted so the reported indicator does not depend on hash order.
    let mut types: Vec<&IndicatorType> = indicators.keys().collect();
    types.sort();
    for indicator_type in types {
        match indicators[indicator_type].first_valid_index() {
            Some(first) => warmup = warmup.max(first),
            None => {
                return Err(EngineError::WarmupExceedsData {
                    indicator: indicator_type.to_string(),
                    bars,
                })
            }
        }
    }
    Ok(warmup)
}

fn sizing_atr(
    sizing: &PositionSizing,
    bars: &[Bar],
    indicators: &HashMap<IndicatorType, IndicatorSeries>,
    idx: usize,
) -> Option<f64> {
    match sizing {
        PositionSizing::RiskBased { atr: Some(atr), .. } => {
            resolve_operand(&Operand::Indicator(atr.clone()), bars, indicators, idx)
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::indicator::test_support::bars_from_closes;
    use crate::domain::request::{SeriesKey, Timeframe};
    use approx::assert_relative_eq;
    use chrono::NaiveDate;

    fn series(closes: &[f64]) -> MarketSeries {
        let key = SeriesKey::new(
            "TEST",
            Timeframe::D1,
            NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(2024, 12, 31).unwrap(),
        );
        MarketSeries::new(key, bars_from_closes(closes))
    }

    fn frictionless() -> ExecutionConfig {
        ExecutionConfig {
            commission_pct: 0.0,
            ..Default::default()
        }
    }

    fn program(text: &str) -> StrategyProgram {
        StrategyProgram::parse(text).unwrap()
    }

    #[test]
    fn buy_and_hold_keeps_one_open_trade() {
        let program = program("[strategy]\nentry_long = ALWAYS\n[sizing]\npercent = 100\n");
        let log = run(&program, &series(&[10.0, 11.0, 12.0, 13.0]), 1_000.0, &frictionless()).unwrap();

        assert_eq!(log.trades.len(), 1);
        assert!(log.trades[0].is_open());
        assert_relative_eq!(log.trades[0].quantity, 100.0);
        assert_relative_eq!(log.trades[0].pnl, 300.0);
        assert_eq!(log.equity_curve.len(), 4);
        assert_relative_eq!(log.ending_value().unwrap(), 1_300.0);
        assert_eq!(log.bars_processed, 4);
        assert_relative_eq!(log.first_close, 10.0);
        assert_relative_eq!(log.last_close, 13.0);
    }

    #[test]
    fn exit_signal_closes_and_waits_a_bar() {
        let program = program(
            "[strategy]\nentry_long = ABOVE(close, 0)\nexit_long = ABOVE(close, 11.5)\n[sizing]\npercent = 100\n",
        );
        let log = run(&program, &series(&[10.0, 12.0, 10.0, 10.0]), 1_000.0, &frictionless()).unwrap();

        // enter bar 0, exit bar 1, no re-entry on bar 1, re-enter bar 2
        assert_eq!(log.trades.len(), 2);
        assert_eq!(log.trades[0].exit_reason, Some(ExitReason::Signal));
        assert_relative_eq!(log.trades[0].pnl, 200.0);
        assert_eq!(log.trades[1].entry_time, log.equity_curve[2].timestamp);
        assert!(log.trades[1].is_open());
    }

    #[test]
    fn signals_wait_for_indicator_warmup() {
        let program = program("[strategy]\nentry_long = ABOVE(close, SMA(3))\n");
        let log = run(&program, &series(&[1.0, 2.0, 3.0, 4.0, 5.0]), 1_000.0, &frictionless()).unwrap();
        assert_eq!(log.trades.len(), 1);
        assert_eq!(log.trades[0].entry_time, log.equity_curve[2].timestamp);
    }

    #[test]
    fn indicator_longer_than_series_is_an_error() {
        let program = program("[strategy]\nentry_long = ABOVE(close, SMA(50))\n");
        let err = run(&program, &series(&[1.0, 2.0, 3.0]), 1_000.0, &frictionless()).unwrap_err();
        assert!(matches!(err, EngineError::WarmupExceedsData { ref indicator, bars: 3 } if indicator == "SMA(50)"));
        assert_eq!(err.fragment().as_deref(), Some("SMA(50)"));
    }

    #[test]
    fn single_bar_is_insufficient() {
        let program = program("[strategy]\nentry_long = ALWAYS\n");
        let err = run(&program, &series(&[1.0]), 1_000.0, &frictionless()).unwrap_err();
        assert_eq!(err, EngineError::InsufficientData { bars: 1, minimum: 2 });
    }

    #[test]
    fn short_entries_respect_config() {
        let program = program("[strategy]\nentry_short = ALWAYS\n[sizing]\npercent = 100\n");
        let closes = [10.0, 9.0, 8.0];

        let log = run(&program, &series(&closes), 1_000.0, &frictionless()).unwrap();
        assert_eq!(log.trades.len(), 1);
        assert_eq!(log.trades[0].direction, Direction::Short);
        assert_relative_eq!(log.ending_value().unwrap(), 1_200.0);

        let config = ExecutionConfig {
            allow_shorting: false,
            ..frictionless()
        };
        let log = run(&program, &series(&closes), 1_000.0, &config).unwrap();
        assert!(log.trades.is_empty());
        assert_relative_eq!(log.ending_value().unwrap(), 1_000.0);
    }

    #[test]
    fn stop_loss_fires_before_signals() {
        let program = program(
            "[strategy]\nentry_long = ALWAYS\n[sizing]\npercent = 100\n[risk]\nstop_loss = 5\n",
        );
        let log = run(&program, &series(&[100.0, 94.0, 96.0]), 10_000.0, &frictionless()).unwrap();
        assert_eq!(log.trades[0].exit_reason, Some(ExitReason::StopLoss));
        // re-entry waits for the bar after the stop
        assert_eq!(log.trades.len(), 2);
        assert_eq!(log.trades[1].entry_time, log.equity_curve[2].timestamp);
    }

    #[test]
    fn repeated_runs_are_identical() {
        let program = program(
            "[strategy]\nentry_long = CROSS_ABOVE(close, SMA(3))\nexit_long = CROSS_BELOW(close, SMA(3))\n",
        );
        let closes: Vec<f64> = (0..60).map(|i| 100.0 + ((i as f64) * 0.7).sin() * 5.0).collect();
        let s = series(&closes);
        let a = run(&program, &s, 10_000.0, &ExecutionConfig::default()).unwrap();
        let b = run(&program, &s, 10_000.0, &ExecutionConfig::default()).unwrap();
        assert_eq!(a, b);
        assert!(!a.trades.is_empty());
    }
}
