//! Rolling population standard deviation of closes.

use crate::domain::indicator::{IndicatorSeries, IndicatorType};
use crate::domain::ohlcv::Bar;

pub fn calculate_stddev(bars: &[Bar], period: usize) -> IndicatorSeries {
    if period == 0 || bars.is_empty() {
        return IndicatorSeries::empty(IndicatorType::Stddev(period));
    }

    let values = (0..bars.len())
        .map(|i| (i + 1 >= period).then(|| window_stats(&bars[i + 1 - period..=i]).1))
        .collect();

    IndicatorSeries::simple(IndicatorType::Stddev(period), bars, values)
}

/// (mean, population stddev) of the window's closes.
pub(crate) fn window_stats(window: &[Bar]) -> (f64, f64) {
    let n = window.len() as f64;
    let mean = window.iter().map(|b| b.close).sum::<f64>() / n;
    let variance = window.iter().map(|b| (b.close - mean).powi(2)).sum::<f64>() / n;
    (mean, variance.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::indicator::test_support::bars_from_closes;
    use approx::assert_relative_eq;

    #[test]
    fn stddev_population() {
        let bars = bars_from_closes(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]);
        let series = calculate_stddev(&bars, 8);
        assert_relative_eq!(series.simple_at(7).unwrap(), 2.0);
        assert_eq!(series.first_valid_index(), Some(7));
    }

    #[test]
    fn stddev_constant_is_zero() {
        let bars = bars_from_closes(&[3.0; 4]);
        let series = calculate_stddev(&bars, 2);
        assert_relative_eq!(series.simple_at(3).unwrap(), 0.0);
    }
}
