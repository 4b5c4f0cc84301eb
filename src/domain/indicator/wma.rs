//! Weighted Moving Average, weights 1..=n with the newest bar heaviest.
//!
//! Maintained in O(1) per bar: the weighted sum loses the whole window sum and
//! gains n * C[i] on each step.

use crate::domain::indicator::{IndicatorSeries, IndicatorType};
use crate::domain::ohlcv::Bar;

pub fn calculate_wma(bars: &[Bar], period: usize) -> IndicatorSeries {
    if period == 0 || bars.is_empty() {
        return IndicatorSeries::empty(IndicatorType::Wma(period));
    }

    let divisor = (period * (period + 1)) as f64 / 2.0;
    let n = period as f64;
    let mut weighted = 0.0;
    let mut window = 0.0;
    let mut values = Vec::with_capacity(bars.len());

    for (i, bar) in bars.iter().enumerate() {
        if i < period {
            weighted += (i + 1) as f64 * bar.close;
            window += bar.close;
        } else {
            weighted += n * bar.close - window;
            window += bar.close - bars[i - period].close;
        }
        values.push((i + 1 >= period).then(|| weighted / divisor));
    }

    IndicatorSeries::simple(IndicatorType::Wma(period), bars, values)
}
