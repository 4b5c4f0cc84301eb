//! Cumulative VWAP: sum(typical * volume) / sum(volume) from the first bar.
//!
//! Invalid while cumulative volume is zero.

use crate::domain::indicator::{IndicatorSeries, IndicatorType};
use crate::domain::ohlcv::Bar;

pub fn calculate_vwap(bars: &[Bar]) -> IndicatorSeries {
    let mut pv = 0.0;
    let mut volume = 0.0;
    let values = bars
        .iter()
        .map(|bar| {
            pv += bar.typical_price() * bar.volume;
            volume += bar.volume;
            (volume > 0.0).then(|| pv / volume)
        })
        .collect();

    IndicatorSeries::simple(IndicatorType::Vwap, bars, values)
}
