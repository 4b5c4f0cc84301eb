//! Bollinger Bands: SMA middle band, +/- multiplier * population stddev.
//!
//! The multiplier is passed in hundredths (200 = 2.0). Warmup: n - 1 bars.

use crate::domain::indicator::stddev::window_stats;
use crate::domain::indicator::{bollinger_multiplier, IndicatorSeries, IndicatorType, IndicatorValue};
use crate::domain::ohlcv::Bar;

pub fn calculate_bollinger(bars: &[Bar], period: usize, stddev_mult_x100: u32) -> IndicatorSeries {
    let indicator_type = IndicatorType::Bollinger {
        period,
        stddev_mult_x100,
    };
    if period == 0 || bars.is_empty() {
        return IndicatorSeries::empty(indicator_type);
    }

    let mult = bollinger_multiplier(stddev_mult_x100);
    let values: Vec<Option<IndicatorValue>> = (0..bars.len())
        .map(|i| {
            (i + 1 >= period).then(|| {
                let (middle, stddev) = window_stats(&bars[i + 1 - period..=i]);
                IndicatorValue::Bollinger {
                    upper: middle + mult * stddev,
                    middle,
                    lower: middle - mult * stddev,
                }
            })
        })
        .collect();

    IndicatorSeries::from_values(indicator_type, bars, values)
}
