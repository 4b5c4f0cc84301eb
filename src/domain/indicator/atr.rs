//! Average True Range with Wilder's smoothing.
//!
//! TR[0] = high - low; later bars use the previous close. The first ATR is the
//! mean of the first n true ranges, then ATR = (prev * (n-1) + TR) / n.

use crate::domain::indicator::{IndicatorSeries, IndicatorType};
use crate::domain::ohlcv::Bar;

pub fn calculate_atr(bars: &[Bar], period: usize) -> IndicatorSeries {
    if period == 0 || bars.is_empty() {
        return IndicatorSeries::empty(IndicatorType::Atr(period));
    }

    let tr = true_ranges(bars);
    IndicatorSeries::simple(IndicatorType::Atr(period), bars, wilder(&tr, period))
}

pub(crate) fn true_ranges(bars: &[Bar]) -> Vec<f64> {
    bars.iter()
        .enumerate()
        .map(|(i, bar)| match i {
            0 => bar.high - bar.low,
            _ => bar.true_range(bars[i - 1].close),
        })
        .collect()
}

/// Wilder average seeded with the mean of the first `period` inputs.
pub(crate) fn wilder(input: &[f64], period: usize) -> Vec<Option<f64>> {
    let n = period as f64;
    let mut out = Vec::with_capacity(input.len());
    let mut acc = 0.0;
    for (i, &x) in input.iter().enumerate() {
        if i + 1 < period {
            acc += x;
            out.push(None);
        } else if i + 1 == period {
            acc = (acc + x) / n;
            out.push(Some(acc));
        } else {
            acc = (acc * (n - 1.0) + x) / n;
            out.push(Some(acc));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::indicator::test_support::bars_from_hlc;
    use approx::assert_relative_eq;

    #[test]
    fn atr_seed_and_smoothing() {
        let bars = bars_from_hlc(&[
            (12.0, 8.0, 10.0),  // TR 4
            (13.0, 9.0, 12.0),  // TR 4
            (15.0, 11.0, 14.0), // TR 4
            (20.0, 14.0, 19.0), // TR max(6, 6, 0) = 6
        ]);
        let series = calculate_atr(&bars, 3);

        assert_eq!(series.first_valid_index(), Some(2));
        assert_relative_eq!(series.simple_at(2).unwrap(), 4.0);
        assert_relative_eq!(series.simple_at(3).unwrap(), (4.0 * 2.0 + 6.0) / 3.0);
    }

    #[test]
    fn atr_uses_gap_from_prior_close() {
        let bars = bars_from_hlc(&[(11.0, 9.0, 10.0), (31.0, 29.0, 30.0)]);
        let tr = true_ranges(&bars);
        assert_relative_eq!(tr[1], 21.0);
    }

    #[test]
    fn atr_too_short_has_no_valid_points() {
        let bars = bars_from_hlc(&[(11.0, 9.0, 10.0)]);
        assert_eq!(calculate_atr(&bars, 14).first_valid_index(), None);
    }
}
