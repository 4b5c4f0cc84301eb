//! MACD (Moving Average Convergence Divergence).
//!
//! MACD Line = EMA(fast) - EMA(slow)
//! Signal Line = EMA(signal) of the MACD line, seeded once the line exists
//! Histogram = MACD Line - Signal Line
//!
//! Warmup: max(fast, slow) - 1 + signal - 1 bars.

use crate::domain::indicator::ema::ema_values;
use crate::domain::indicator::{IndicatorSeries, IndicatorType, IndicatorValue};
use crate::domain::ohlcv::Bar;

pub const DEFAULT_FAST: usize = 12;
pub const DEFAULT_SLOW: usize = 26;
pub const DEFAULT_SIGNAL: usize = 9;

pub fn calculate_macd(bars: &[Bar], fast: usize, slow: usize, signal: usize) -> IndicatorSeries {
    let indicator_type = IndicatorType::Macd { fast, slow, signal };
    if bars.is_empty() || fast == 0 || slow == 0 || signal == 0 {
        return IndicatorSeries::empty(indicator_type);
    }

    let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
    let ema_fast = ema_values(&closes, fast);
    let ema_slow = ema_values(&closes, slow);

    let line: Vec<Option<f64>> = ema_fast
        .iter()
        .zip(&ema_slow)
        .map(|(f, s)| Some((*f)? - (*s)?))
        .collect();

    let line_start = fast.max(slow) - 1;
    let defined: Vec<f64> = line.iter().skip(line_start).flatten().copied().collect();
    let signal_line = ema_values(&defined, signal);

    let values = line.iter().enumerate().map(|(i, line)| {
        let line = (*line)?;
        let signal = (*signal_line.get(i.checked_sub(line_start)?)?)?;
        Some(IndicatorValue::Macd {
            line,
            signal,
            histogram: line - signal,
        })
    });

    IndicatorSeries::from_values(indicator_type, bars, values.collect::<Vec<_>>())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::indicator::calculate_ema;
    use crate::domain::indicator::test_support::bars_from_closes;
    use approx::assert_relative_eq;

    fn ramp(n: usize) -> Vec<Bar> {
        let closes: Vec<f64> = (0..n).map(|i| 100.0 + (i as f64 * 0.7).sin() * 5.0 + i as f64).collect();
        bars_from_closes(&closes)
    }

    #[test]
    fn macd_warmup() {
        let bars = ramp(20);
        let series = calculate_macd(&bars, 3, 6, 4);
        assert_eq!(series.first_valid_index(), Some(6 - 1 + 4 - 1));
    }

    #[test]
    fn macd_line_is_ema_difference() {
        let bars = ramp(30);
        let series = calculate_macd(&bars, 3, 6, 4);
        let fast = calculate_ema(&bars, 3);
        let slow = calculate_ema(&bars, 6);

        for i in 8..30 {
            match series.value_at(i) {
                Some(IndicatorValue::Macd {
                    line,
                    signal,
                    histogram,
                }) => {
                    let expected = fast.simple_at(i).unwrap() - slow.simple_at(i).unwrap();
                    assert_relative_eq!(*line, expected, epsilon = 1e-9);
                    assert_relative_eq!(*histogram, line - signal, epsilon = 1e-12);
                }
                other => panic!("expected MACD at {i}, got {other:?}"),
            }
        }
    }

    #[test]
    fn macd_signal_seed_is_mean_of_line() {
        let bars = ramp(20);
        let series = calculate_macd(&bars, 2, 4, 3);
        let fast = calculate_ema(&bars, 2);
        let slow = calculate_ema(&bars, 4);
        let line = |i: usize| fast.simple_at(i).unwrap() - slow.simple_at(i).unwrap();

        let seed = (line(3) + line(4) + line(5)) / 3.0;
        match series.value_at(5) {
            Some(IndicatorValue::Macd { signal, .. }) => {
                assert_relative_eq!(*signal, seed, epsilon = 1e-9)
            }
            other => panic!("expected MACD, got {other:?}"),
        }
    }

    #[test]
    fn macd_constant_prices_are_zero() {
        let bars = bars_from_closes(&[50.0; 40]);
        let series = calculate_macd(&bars, DEFAULT_FAST, DEFAULT_SLOW, DEFAULT_SIGNAL);
        match series.value_at(39) {
            Some(IndicatorValue::Macd { line, signal, .. }) => {
                assert_relative_eq!(*line, 0.0, epsilon = 1e-9);
                assert_relative_eq!(*signal, 0.0, epsilon = 1e-9);
            }
            other => panic!("expected MACD, got {other:?}"),
        }
    }

    #[test]
    fn macd_zero_period() {
        let bars = ramp(5);
        assert!(calculate_macd(&bars, 0, 26, 9).values.is_empty());
    }
}
