//! On-Balance Volume. Starts at the first bar's volume; no warmup.

use crate::domain::indicator::{IndicatorSeries, IndicatorType};
use crate::domain::ohlcv::Bar;

pub fn calculate_obv(bars: &[Bar]) -> IndicatorSeries {
    let mut obv = 0.0;
    let values = bars
        .iter()
        .enumerate()
        .map(|(i, bar)| {
            if i == 0 {
                obv = bar.volume;
            } else if bar.close > bars[i - 1].close {
                obv += bar.volume;
            } else if bar.close < bars[i - 1].close {
                obv -= bar.volume;
            }
            Some(obv)
        })
        .collect();

    IndicatorSeries::simple(IndicatorType::Obv, bars, values)
}
