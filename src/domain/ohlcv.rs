//! OHLCV bars and market series.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::request::SeriesKey;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Bar {
    /// (high + low + close) / 3
    pub fn typical_price(&self) -> f64 {
        (self.high + self.low + self.close) / 3.0
    }

    /// max(high - low, |high - prev_close|, |low - prev_close|)
    pub fn true_range(&self, prev_close: f64) -> f64 {
        let hl = self.high - self.low;
        let hc = (self.high - prev_close).abs();
        let lc = (self.low - prev_close).abs();
        hl.max(hc).max(lc)
    }

    pub fn is_well_formed(&self) -> bool {
        [self.open, self.high, self.low, self.close, self.volume]
            .iter()
            .all(|v| v.is_finite())
            && self.close > 0.0
            && self.high >= self.low
    }
}

/// Ordered bars for one [`SeriesKey`]. Shared read-only across repair attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketSeries {
    pub key: SeriesKey,
    pub bars: Vec<Bar>,
}

impl MarketSeries {
    /// Build a series, dropping malformed bars and restoring timestamp order.
    pub fn new(key: SeriesKey, mut bars: Vec<Bar>) -> Self {
        bars.retain(Bar::is_well_formed);
        bars.sort_by_key(|b| b.timestamp);
        bars.dedup_by_key(|b| b.timestamp);
        Self { key, bars }
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    pub fn first_close(&self) -> Option<f64> {
        self.bars.first().map(|b| b.close)
    }

    pub fn last_close(&self) -> Option<f64> {
        self.bars.last().map(|b| b.close)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::request::Timeframe;
    use chrono::{NaiveDate, TimeZone};

    fn sample_bar() -> Bar {
        Bar {
            timestamp: Utc.with_ymd_and_hms(2024, 1, 15, 0, 0, 0).unwrap(),
            open: 100.0,
            high: 110.0,
            low: 90.0,
            close: 105.0,
            volume: 50_000.0,
        }
    }

    #[test]
    fn typical_price() {
        let bar = sample_bar();
        let expected = (110.0 + 90.0 + 105.0) / 3.0;
        assert!((bar.typical_price() - expected).abs() < f64::EPSILON);
    }

    #[test]
    fn true_range_hl_dominates() {
        let bar = sample_bar();
        assert!((bar.true_range(100.0) - 20.0).abs() < f64::EPSILON);
    }

    #[test]
    fn true_range_gap_up() {
        let bar = sample_bar();
        // high-low=20, |110-70|=40, |90-70|=20 → 40
        assert!((bar.true_range(70.0) - 40.0).abs() < f64::EPSILON);
    }

    #[test]
    fn true_range_gap_down() {
        let bar = sample_bar();
        assert!((bar.true_range(130.0) - 40.0).abs() < f64::EPSILON);
    }

    #[test]
    fn series_drops_malformed_and_sorts() {
        let key = SeriesKey::new(
            "TEST",
            Timeframe::D1,
            NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(2024, 2, 1).unwrap(),
        );
        let mut later = sample_bar();
        later.timestamp = Utc.with_ymd_and_hms(2024, 1, 16, 0, 0, 0).unwrap();
        let mut broken = sample_bar();
        broken.close = f64::NAN;
        broken.timestamp = Utc.with_ymd_and_hms(2024, 1, 17, 0, 0, 0).unwrap();

        let series = MarketSeries::new(key, vec![later.clone(), broken, sample_bar()]);
        assert_eq!(series.len(), 2);
        assert_eq!(series.bars[0], sample_bar());
        assert_eq!(series.bars[1], later);
    }
}
