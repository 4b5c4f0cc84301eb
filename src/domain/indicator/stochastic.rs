//! Stochastic oscillator.
//!
//! %K = 100 * (C - LL) / (HH - LL) over k bars, 50 on a flat window.
//! %D = SMA(d) of %K. Valid once %D exists: bar k - 1 + d - 1.

use crate::domain::indicator::sma::rolling_mean;
use crate::domain::indicator::{IndicatorSeries, IndicatorType, IndicatorValue};
use crate::domain::ohlcv::Bar;

pub fn calculate_stochastic(bars: &[Bar], k_period: usize, d_period: usize) -> IndicatorSeries {
    let indicator_type = IndicatorType::Stochastic { k_period, d_period };
    if bars.is_empty() || k_period == 0 || d_period == 0 {
        return IndicatorSeries::empty(indicator_type);
    }

    let k_start = k_period - 1;
    let k_line: Vec<f64> = (k_start..bars.len())
        .map(|i| {
            let window = &bars[i + 1 - k_period..=i];
            let hh = window.iter().map(|b| b.high).fold(f64::MIN, f64::max);
            let ll = window.iter().map(|b| b.low).fold(f64::MAX, f64::min);
            if hh > ll {
                100.0 * (bars[i].close - ll) / (hh - ll)
            } else {
                50.0
            }
        })
        .collect();
    let d_line = rolling_mean(&k_line, d_period);

    let values: Vec<Option<IndicatorValue>> = (0..bars.len())
        .map(|i| {
            let j = i.checked_sub(k_start)?;
            let d = d_line[j]?;
            Some(IndicatorValue::Stochastic { k: k_line[j], d })
        })
        .collect();

    IndicatorSeries::from_values(indicator_type, bars, values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::indicator::test_support::{bars_from_closes, bars_from_hlc};
    use approx::assert_relative_eq;

    #[test]
    fn stochastic_k_and_d() {
        let bars = bars_from_hlc(&[
            (10.0, 0.0, 5.0),
            (10.0, 0.0, 10.0),
            (10.0, 0.0, 0.0),
            (10.0, 0.0, 7.5),
        ]);
        let series = calculate_stochastic(&bars, 2, 2);

        assert_eq!(series.first_valid_index(), Some(2));
        match series.value_at(3) {
            Some(IndicatorValue::Stochastic { k, d }) => {
                assert_relative_eq!(*k, 75.0);
                assert_relative_eq!(*d, (0.0 + 75.0) / 2.0);
            }
            other => panic!("expected stochastic, got {other:?}"),
        }
    }

    #[test]
    fn stochastic_flat_window_is_midpoint() {
        let bars = bars_from_closes(&[5.0; 5]);
        let series = calculate_stochastic(&bars, 3, 1);
        match series.value_at(4) {
            Some(IndicatorValue::Stochastic { k, .. }) => assert_relative_eq!(*k, 50.0),
            other => panic!("expected stochastic, got {other:?}"),
        }
    }

    #[test]
    fn stochastic_short_series() {
        let bars = bars_from_closes(&[1.0, 2.0]);
        let series = calculate_stochastic(&bars, 14, 3);
        assert_eq!(series.values.len(), 2);
        assert_eq!(series.first_valid_index(), None);
    }
}
