//! ADX (Average Directional Index), Wilder.
//!
//! +DM/-DM and TR are taken from consecutive bars, Wilder-smoothed over n,
//! giving +DI and -DI. DX = 100 * |+DI - -DI| / (+DI + -DI), and ADX is the
//! Wilder-smoothed DX. First valid bar: 2n - 1.

use crate::domain::indicator::atr::wilder;
use crate::domain::indicator::{IndicatorSeries, IndicatorType, IndicatorValue};
use crate::domain::ohlcv::Bar;

pub fn calculate_adx(bars: &[Bar], period: usize) -> IndicatorSeries {
    let indicator_type = IndicatorType::Adx(period);
    if period == 0 || bars.is_empty() {
        return IndicatorSeries::empty(indicator_type);
    }
    if bars.len() < 2 {
        return IndicatorSeries::from_values(indicator_type, bars, [None]);
    }

    // Index j in these vectors belongs to bar j + 1.
    let mut plus_dm = Vec::with_capacity(bars.len() - 1);
    let mut minus_dm = Vec::with_capacity(bars.len() - 1);
    let mut tr = Vec::with_capacity(bars.len() - 1);
    for pair in bars.windows(2) {
        let (prev, bar) = (&pair[0], &pair[1]);
        let up = bar.high - prev.high;
        let down = prev.low - bar.low;
        plus_dm.push(if up > down && up > 0.0 { up } else { 0.0 });
        minus_dm.push(if down > up && down > 0.0 { down } else { 0.0 });
        tr.push(bar.true_range(prev.close));
    }

    let smooth_tr = wilder(&tr, period);
    let smooth_plus = wilder(&plus_dm, period);
    let smooth_minus = wilder(&minus_dm, period);

    let di: Vec<Option<(f64, f64)>> = smooth_tr
        .iter()
        .zip(smooth_plus.iter().zip(&smooth_minus))
        .map(|(t, (p, m))| match (t, p, m) {
            (Some(t), Some(p), Some(m)) if *t > 0.0 => Some((100.0 * p / t, 100.0 * m / t)),
            (Some(_), Some(_), Some(_)) => Some((0.0, 0.0)),
            _ => None,
        })
        .collect();

    let first_di = di.iter().position(Option::is_some);
    let dx: Vec<f64> = di
        .iter()
        .flatten()
        .map(|&(plus, minus)| {
            let sum = plus + minus;
            if sum == 0.0 {
                0.0
            } else {
                100.0 * (plus - minus).abs() / sum
            }
        })
        .collect();
    let adx = wilder(&dx, period);

    let mut values = vec![None];
    for (j, di_point) in di.iter().enumerate() {
        let value = match (first_di, di_point) {
            (Some(first), Some((plus_di, minus_di))) => {
                adx[j - first].map(|adx| IndicatorValue::Adx {
                    adx,
                    plus_di: *plus_di,
                    minus_di: *minus_di,
                })
            }
            _ => None,
        };
        values.push(value);
    }

    IndicatorSeries::from_values(indicator_type, bars, values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::indicator::test_support::bars_from_hlc;

    fn trending_up(n: usize) -> Vec<Bar> {
        let hlc: Vec<(f64, f64, f64)> = (0..n)
            .map(|i| {
                let base = 100.0 + i as f64 * 2.0;
                (base + 1.0, base - 1.0, base + 0.5)
            })
            .collect();
        bars_from_hlc(&hlc)
    }

    #[test]
    fn adx_first_valid_at_two_periods() {
        let bars = trending_up(20);
        let series = calculate_adx(&bars, 3);
        assert_eq!(series.values.len(), 20);
        assert_eq!(series.first_valid_index(), Some(5));
    }

    #[test]
    fn adx_strong_uptrend() {
        let bars = trending_up(30);
        let series = calculate_adx(&bars, 5);
        match series.value_at(29) {
            Some(IndicatorValue::Adx {
                adx,
                plus_di,
                minus_di,
            }) => {
                assert!(*plus_di > *minus_di);
                assert!(*minus_di == 0.0);
                assert!((*adx - 100.0).abs() < 1e-9);
            }
            other => panic!("expected ADX value, got {other:?}"),
        }
    }

    #[test]
    fn adx_stays_in_bounds() {
        let hlc: Vec<(f64, f64, f64)> = (0..40)
            .map(|i| {
                let swing = if i % 3 == 0 { 4.0 } else { -3.0 };
                let base = 100.0 + swing + (i % 7) as f64;
                (base + 2.0, base - 2.0, base)
            })
            .collect();
        let bars = bars_from_hlc(&hlc);
        let series = calculate_adx(&bars, 5);
        for i in 0..bars.len() {
            if let Some(IndicatorValue::Adx { adx, .. }) = series.value_at(i) {
                assert!((0.0..=100.0).contains(adx));
            }
        }
    }

    #[test]
    fn adx_single_bar() {
        let bars = trending_up(1);
        let series = calculate_adx(&bars, 14);
        assert_eq!(series.values.len(), 1);
        assert_eq!(series.first_valid_index(), None);
    }
}
