//! Technical indicator implementations.
//!
//! - `IndicatorPoint`: A single point in an indicator time series
//! - `IndicatorValue`: Enum for different indicator output shapes
//! - `IndicatorType`: Enum for indicator identity + parameters (serves as HashMap key)
//! - `IndicatorSeries`: A time series of indicator values, aligned with the input bars

pub mod adx;
pub mod atr;
pub mod bollinger;
pub mod ema;
pub mod macd;
pub mod obv;
pub mod roc;
pub mod rsi;
pub mod sma;
pub mod stddev;
pub mod stochastic;
pub mod vwap;
pub mod wma;

pub use ema::calculate_ema;
pub use sma::calculate_sma;

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt;

use crate::domain::ohlcv::Bar;

#[derive(Debug, Clone)]
pub struct IndicatorPoint {
    pub timestamp: DateTime<Utc>,
    pub valid: bool,
    pub value: IndicatorValue,
}

#[derive(Debug, Clone, PartialEq)]
pub enum IndicatorValue {
    Simple(f64),
    Macd {
        line: f64,
        signal: f64,
        histogram: f64,
    },
    Stochastic {
        k: f64,
        d: f64,
    },
    Bollinger {
        upper: f64,
        middle: f64,
        lower: f64,
    },
    Adx {
        adx: f64,
        plus_di: f64,
        minus_di: f64,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum IndicatorType {
    Sma(usize),
    Ema(usize),
    Wma(usize),
    Rsi(usize),
    Roc(usize),
    Atr(usize),
    Stddev(usize),
    Obv,
    Vwap,
    Macd {
        fast: usize,
        slow: usize,
        signal: usize,
    },
    Stochastic {
        k_period: usize,
        d_period: usize,
    },
    Bollinger {
        period: usize,
        stddev_mult_x100: u32,
    },
    Adx(usize),
}

#[derive(Debug, Clone)]
pub struct IndicatorSeries {
    pub indicator_type: IndicatorType,
    pub values: Vec<IndicatorPoint>,
}

impl IndicatorSeries {
    /// Pair per-bar values with bar timestamps; `None` marks a warmup bar.
    pub fn from_values(
        indicator_type: IndicatorType,
        bars: &[Bar],
        values: impl IntoIterator<Item = Option<IndicatorValue>>,
    ) -> Self {
        let values = bars
            .iter()
            .zip(values)
            .map(|(bar, value)| IndicatorPoint {
                timestamp: bar.timestamp,
                valid: value.is_some(),
                value: value.unwrap_or(IndicatorValue::Simple(f64::NAN)),
            })
            .collect();
        Self {
            indicator_type,
            values,
        }
    }

    pub fn simple(indicator_type: IndicatorType, bars: &[Bar], values: Vec<Option<f64>>) -> Self {
        Self::from_values(
            indicator_type,
            bars,
            values.into_iter().map(|v| v.map(IndicatorValue::Simple)),
        )
    }

    pub fn empty(indicator_type: IndicatorType) -> Self {
        Self {
            indicator_type,
            values: Vec::new(),
        }
    }

    /// Value at `index` when that point is past warmup.
    pub fn value_at(&self, index: usize) -> Option<&IndicatorValue> {
        self.values
            .get(index)
            .filter(|p| p.valid)
            .map(|p| &p.value)
    }

    pub fn simple_at(&self, index: usize) -> Option<f64> {
        match self.value_at(index) {
            Some(IndicatorValue::Simple(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn first_valid_index(&self) -> Option<usize> {
        self.values.iter().position(|p| p.valid)
    }
}

impl fmt::Display for IndicatorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndicatorType::Sma(period) => write!(f, "SMA({})", period),
            IndicatorType::Ema(period) => write!(f, "EMA({})", period),
            IndicatorType::Wma(period) => write!(f, "WMA({})", period),
            IndicatorType::Rsi(period) => write!(f, "RSI({})", period),
            IndicatorType::Roc(period) => write!(f, "ROC({})", period),
            IndicatorType::Atr(period) => write!(f, "ATR({})", period),
            IndicatorType::Stddev(period) => write!(f, "STDDEV({})", period),
            IndicatorType::Obv => write!(f, "OBV"),
            IndicatorType::Vwap => write!(f, "VWAP"),
            IndicatorType::Macd { fast, slow, signal } => {
                write!(f, "MACD({},{},{})", fast, slow, signal)
            }
            IndicatorType::Stochastic { k_period, d_period } => {
                write!(f, "STOCHASTIC({},{})", k_period, d_period)
            }
            IndicatorType::Bollinger {
                period,
                stddev_mult_x100,
            } => write!(f, "BOLLINGER({},{})", period, bollinger_multiplier(*stddev_mult_x100)),
            IndicatorType::Adx(period) => write!(f, "ADX({})", period),
        }
    }
}

/// Bollinger multipliers are keyed in hundredths so the type stays hashable.
pub fn bollinger_multiplier(stddev_mult_x100: u32) -> f64 {
    stddev_mult_x100 as f64 / 100.0
}

pub fn calculate(bars: &[Bar], indicator_type: &IndicatorType) -> IndicatorSeries {
    match *indicator_type {
        IndicatorType::Sma(period) => sma::calculate_sma(bars, period),
        IndicatorType::Ema(period) => ema::calculate_ema(bars, period),
        IndicatorType::Wma(period) => wma::calculate_wma(bars, period),
        IndicatorType::Rsi(period) => rsi::calculate_rsi(bars, period),
        IndicatorType::Roc(period) => roc::calculate_roc(bars, period),
        IndicatorType::Atr(period) => atr::calculate_atr(bars, period),
        IndicatorType::Stddev(period) => stddev::calculate_stddev(bars, period),
        IndicatorType::Obv => obv::calculate_obv(bars),
        IndicatorType::Vwap => vwap::calculate_vwap(bars),
        IndicatorType::Macd { fast, slow, signal } => macd::calculate_macd(bars, fast, slow, signal),
        IndicatorType::Stochastic { k_period, d_period } => {
            stochastic::calculate_stochastic(bars, k_period, d_period)
        }
        IndicatorType::Bollinger {
            period,
            stddev_mult_x100,
        } => bollinger::calculate_bollinger(bars, period, stddev_mult_x100),
        IndicatorType::Adx(period) => adx::calculate_adx(bars, period),
    }
}

/// Compute every requested indicator once over the whole series.
pub fn compute_indicators<'a>(
    bars: &[Bar],
    types: impl IntoIterator<Item = &'a IndicatorType>,
) -> HashMap<IndicatorType, IndicatorSeries> {
    let mut computed = HashMap::new();
    for indicator_type in types {
        computed
            .entry(indicator_type.clone())
            .or_insert_with(|| calculate(bars, indicator_type));
    }
    computed
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::domain::ohlcv::Bar;
    use chrono::{Duration, TimeZone, Utc};

    pub fn bars_from_closes(closes: &[f64]) -> Vec<Bar> {
        let hlc: Vec<(f64, f64, f64)> = closes.iter().map(|&c| (c, c, c)).collect();
        bars_from_hlc(&hlc)
    }

    pub fn bars_from_hlc(hlc: &[(f64, f64, f64)]) -> Vec<Bar> {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        hlc.iter()
            .enumerate()
            .map(|(i, &(high, low, close))| Bar {
                timestamp: start + Duration::days(i as i64),
                open: close,
                high,
                low,
                close,
                volume: 1000.0,
            })
            .collect()
    }
}
