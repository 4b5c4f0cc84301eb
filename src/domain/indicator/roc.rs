//! Rate of Change: ((C - C[n]) / C[n]) * 100. Zero when C[n] is zero.
//!
//! Warmup: first n bars are invalid.

use crate::domain::indicator::{IndicatorSeries, IndicatorType};
use crate::domain::ohlcv::Bar;

pub fn calculate_roc(bars: &[Bar], period: usize) -> IndicatorSeries {
    if period == 0 || bars.is_empty() {
        return IndicatorSeries::empty(IndicatorType::Roc(period));
    }

    let values = (0..bars.len())
        .map(|i| {
            (i >= period).then(|| {
                let prior = bars[i - period].close;
                if prior == 0.0 {
                    0.0
                } else {
                    (bars[i].close - prior) / prior * 100.0
                }
            })
        })
        .collect();

    IndicatorSeries::simple(IndicatorType::Roc(period), bars, values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::indicator::test_support::bars_from_closes;
    use approx::assert_relative_eq;

    #[test]
    fn roc_basic() {
        let bars = bars_from_closes(&[100.0, 105.0, 110.0, 99.0]);
        let series = calculate_roc(&bars, 2);

        assert_eq!(series.first_valid_index(), Some(2));
        assert_relative_eq!(series.simple_at(2).unwrap(), 10.0);
        assert_relative_eq!(series.simple_at(3).unwrap(), (99.0 - 105.0) / 105.0 * 100.0);
    }

    #[test]
    fn roc_period_0() {
        let bars = bars_from_closes(&[1.0, 2.0]);
        assert!(calculate_roc(&bars, 0).values.is_empty());
    }
}
