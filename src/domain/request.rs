//! Backtest request and market-series keys.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::domain::error::RequestError;

const TRADING_DAYS_PER_YEAR: f64 = 252.0;
const TRADING_MINUTES_PER_DAY: f64 = 390.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Timeframe {
    #[serde(rename = "1m")]
    M1,
    #[serde(rename = "5m")]
    M5,
    #[serde(rename = "15m")]
    M15,
    #[serde(rename = "30m")]
    M30,
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "4h")]
    H4,
    #[serde(rename = "1d")]
    D1,
    #[serde(rename = "1w")]
    W1,
}

impl Timeframe {
    pub fn as_str(&self) -> &'static str {
        match self {
            Timeframe::M1 => "1m",
            Timeframe::M5 => "5m",
            Timeframe::M15 => "15m",
            Timeframe::M30 => "30m",
            Timeframe::H1 => "1h",
            Timeframe::H4 => "4h",
            Timeframe::D1 => "1d",
            Timeframe::W1 => "1w",
        }
    }

    /// Bar length in minutes (a trading day counts as 390 minutes).
    pub fn minutes(&self) -> u32 {
        match self {
            Timeframe::M1 => 1,
            Timeframe::M5 => 5,
            Timeframe::M15 => 15,
            Timeframe::M30 => 30,
            Timeframe::H1 => 60,
            Timeframe::H4 => 240,
            Timeframe::D1 => 390,
            Timeframe::W1 => 390 * 5,
        }
    }

    /// Number of bars in a trading year, used to annualize returns and ratios.
    pub fn bars_per_year(&self) -> f64 {
        match self {
            Timeframe::D1 => TRADING_DAYS_PER_YEAR,
            Timeframe::W1 => 52.0,
            intraday => TRADING_DAYS_PER_YEAR * TRADING_MINUTES_PER_DAY / intraday.minutes() as f64,
        }
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Timeframe {
    type Err = RequestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "1m" => Ok(Timeframe::M1),
            "5m" => Ok(Timeframe::M5),
            "15m" => Ok(Timeframe::M15),
            "30m" => Ok(Timeframe::M30),
            "1h" | "60m" => Ok(Timeframe::H1),
            "4h" => Ok(Timeframe::H4),
            "1d" | "d" | "daily" => Ok(Timeframe::D1),
            "1w" | "1wk" | "w" | "weekly" => Ok(Timeframe::W1),
            _ => Err(RequestError::Timeframe {
                value: s.to_string(),
            }),
        }
    }
}

/// Cache key of a market series: symbol, timeframe and inclusive date range.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SeriesKey {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl SeriesKey {
    pub fn new(symbol: &str, timeframe: Timeframe, start: NaiveDate, end: NaiveDate) -> Self {
        Self {
            symbol: symbol.trim().to_uppercase(),
            timeframe,
            start,
            end,
        }
    }

    /// File-system safe name, used by the on-disk cache.
    pub fn file_stem(&self) -> String {
        let symbol: String = self
            .symbol
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        format!(
            "{}_{}_{}_{}",
            symbol,
            self.timeframe,
            self.start.format("%Y%m%d"),
            self.end.format("%Y%m%d")
        )
    }
}

impl fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {}..{}",
            self.symbol, self.timeframe, self.start, self.end
        )
    }
}

/// Immutable input to a single pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyRequest {
    text: String,
    symbol: String,
    timeframe: Timeframe,
    start: NaiveDate,
    end: NaiveDate,
    initial_capital: f64,
}

impl StrategyRequest {
    pub fn new(
        text: &str,
        symbol: &str,
        timeframe: Timeframe,
        start: NaiveDate,
        end: NaiveDate,
        initial_capital: f64,
    ) -> Result<Self, RequestError> {
        if text.trim().is_empty() {
            return Err(RequestError::Empty {
                field: "strategy text",
            });
        }
        if symbol.trim().is_empty() {
            return Err(RequestError::Empty { field: "symbol" });
        }
        if start >= end {
            return Err(RequestError::DateRange {
                start: start.to_string(),
                end: end.to_string(),
            });
        }
        if !initial_capital.is_finite() || initial_capital <= 0.0 {
            return Err(RequestError::Capital {
                value: initial_capital,
            });
        }
        Ok(Self {
            text: text.trim().to_string(),
            symbol: symbol.trim().to_uppercase(),
            timeframe,
            start,
            end,
            initial_capital,
        })
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn timeframe(&self) -> Timeframe {
        self.timeframe
    }

    pub fn start(&self) -> NaiveDate {
        self.start
    }

    pub fn end(&self) -> NaiveDate {
        self.end
    }

    pub fn initial_capital(&self) -> f64 {
        self.initial_capital
    }

    pub fn series_key(&self) -> SeriesKey {
        SeriesKey::new(&self.symbol, self.timeframe, self.start, self.end)
    }
}
