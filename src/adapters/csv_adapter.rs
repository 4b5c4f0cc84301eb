//! CSV market data: a directory of per-symbol files, plus the CSV codec the
//! on-disk cache shares.
//!
//! Files are `<SYMBOL>_<timeframe>.csv` or `<SYMBOL>.csv` with a header row
//! and columns `date,open,high,low,close,volume`. Dates are `YYYY-MM-DD`,
//! `YYYY-MM-DD HH:MM:SS` (UTC) or RFC 3339.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use std::path::{Path, PathBuf};

use crate::domain::error::MarketDataError;
use crate::domain::ohlcv::{Bar, MarketSeries};
use crate::domain::request::SeriesKey;
use crate::ports::market_data_port::MarketDataProvider;

pub struct CsvAdapter {
    base_path: PathBuf,
}

impl CsvAdapter {
    pub fn new(base_path: PathBuf) -> Self {
        Self { base_path }
    }

    /// Timeframe-specific file first, then the plain symbol file.
    fn candidates(&self, key: &SeriesKey) -> [PathBuf; 2] {
        [
            self.base_path
                .join(format!("{}_{}.csv", key.symbol, key.timeframe)),
            self.base_path.join(format!("{}.csv", key.symbol)),
        ]
    }
}

#[async_trait]
impl MarketDataProvider for CsvAdapter {
    async fn fetch(&self, key: &SeriesKey) -> Result<MarketSeries, MarketDataError> {
        for path in self.candidates(key) {
            match tokio::fs::read_to_string(&path).await {
                Ok(content) => {
                    let bars = parse_bars(&content, &path)?;
                    let series = MarketSeries::new(key.clone(), in_range(bars, key));
                    if series.is_empty() {
                        return Err(MarketDataError::NotFound {
                            symbol: key.symbol.clone(),
                        });
                    }
                    tracing::debug!(path = %path.display(), bars = series.len(), "loaded csv series");
                    return Ok(series);
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => {
                    return Err(MarketDataError::Unavailable {
                        reason: format!("failed to read {}: {}", path.display(), e),
                    })
                }
            }
        }
        Err(MarketDataError::NotFound {
            symbol: key.symbol.clone(),
        })
    }
}

fn in_range(bars: Vec<Bar>, key: &SeriesKey) -> Vec<Bar> {
    bars.into_iter()
        .filter(|b| {
            let day = b.timestamp.date_naive();
            day >= key.start && day <= key.end
        })
        .collect()
}

pub fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
        return Some(ts.with_timezone(&Utc));
    }
    if let Ok(ts) = NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S") {
        return Some(ts.and_utc());
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|d| d.and_utc())
}

/// Parse CSV content into bars, in file order.
pub fn parse_bars(content: &str, source: &Path) -> Result<Vec<Bar>, MarketDataError> {
    let malformed = |line: usize, reason: String| MarketDataError::Malformed {
        reason: format!("{}:{}: {}", source.display(), line, reason),
    };

    let mut rdr = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(content.as_bytes());
    let mut bars = Vec::new();

    for (i, result) in rdr.records().enumerate() {
        // header is line 1
        let line = i + 2;
        let record = result.map_err(|e| malformed(line, format!("CSV parse error: {e}")))?;

        let date = record
            .get(0)
            .ok_or_else(|| malformed(line, "missing date column".into()))?;
        let timestamp =
            parse_timestamp(date).ok_or_else(|| malformed(line, format!("invalid date '{date}'")))?;

        let number = |idx: usize, name: &str| -> Result<f64, MarketDataError> {
            let raw = record
                .get(idx)
                .ok_or_else(|| malformed(line, format!("missing {name} column")))?;
            raw.parse::<f64>()
                .map_err(|e| malformed(line, format!("invalid {name} value '{raw}': {e}")))
        };

        bars.push(Bar {
            timestamp,
            open: number(1, "open")?,
            high: number(2, "high")?,
            low: number(3, "low")?,
            close: number(4, "close")?,
            volume: number(5, "volume")?,
        });
    }

    Ok(bars)
}

/// Encode bars in the format [`parse_bars`] reads.
pub fn write_bars(bars: &[Bar]) -> Result<Vec<u8>, MarketDataError> {
    let to_err = |e: csv::Error| MarketDataError::Malformed {
        reason: format!("CSV write error: {e}"),
    };
    let mut wtr = csv::Writer::from_writer(Vec::new());
    wtr.write_record(["date", "open", "high", "low", "close", "volume"])
        .map_err(to_err)?;
    for bar in bars {
        wtr.write_record([
            bar.timestamp.to_rfc3339_opts(SecondsFormat::Secs, true),
            bar.open.to_string(),
            bar.high.to_string(),
            bar.low.to_string(),
            bar.close.to_string(),
            bar.volume.to_string(),
        ])
        .map_err(to_err)?;
    }
    wtr.into_inner().map_err(|e| MarketDataError::Malformed {
        reason: format!("CSV write error: {e}"),
    })
}
