//! Yahoo Finance chart API market data provider.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;

use crate::domain::error::MarketDataError;
use crate::domain::ohlcv::{Bar, MarketSeries};
use crate::domain::request::{SeriesKey, Timeframe};
use crate::ports::market_data_port::MarketDataProvider;

const CRYPTO_BASES: &[&str] = &[
    "BTC", "ETH", "SOL", "XRP", "ADA", "DOGE", "LTC", "BCH", "BNB", "AVAX", "DOT", "SHIB",
    "MATIC", "LINK", "TRX", "XLM", "XMR", "ETC", "UNI", "ATOM", "FIL", "NEAR",
];

const CRYPTO_QUOTES: &[&str] = &["USDT", "BTC", "ETH"];

pub struct YahooAdapter {
    client: reqwest::Client,
    base_url: String,
}

impl YahooAdapter {
    pub fn new(base_url: &str, timeout: std::time::Duration) -> Result<Self, MarketDataError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("stratforge/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| MarketDataError::Unavailable {
                reason: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl MarketDataProvider for YahooAdapter {
    async fn fetch(&self, key: &SeriesKey) -> Result<MarketSeries, MarketDataError> {
        let ticker = normalize_symbol(&key.symbol);
        let period1 = midnight(key.start);
        // end date is inclusive
        let period2 = midnight(key.end) + 86_400;
        let url = format!("{}/v8/finance/chart/{}", self.base_url, ticker);

        tracing::debug!(%key, %ticker, "fetching yahoo chart");
        let response = self
            .client
            .get(&url)
            .query(&[
                ("period1", period1.to_string()),
                ("period2", period2.to_string()),
                ("interval", interval(key.timeframe).to_string()),
                ("includePrePost", "false".to_string()),
            ])
            .send()
            .await
            .map_err(|e| MarketDataError::Unavailable {
                reason: format!("request to {url} failed: {e}"),
            })?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(MarketDataError::RateLimited);
        }
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(MarketDataError::NotFound {
                symbol: key.symbol.clone(),
            });
        }
        if !status.is_success() {
            return Err(MarketDataError::Unavailable {
                reason: format!("yahoo returned HTTP {status} for {ticker}"),
            });
        }

        let body = response
            .text()
            .await
            .map_err(|e| MarketDataError::Unavailable {
                reason: format!("failed to read response body: {e}"),
            })?;
        let bars = parse_chart(&body, &key.symbol)?;
        let bars = if key.timeframe == Timeframe::H4 {
            resample(&bars, Timeframe::H4)
        } else {
            bars
        };

        let series = MarketSeries::new(key.clone(), bars);
        if series.is_empty() {
            return Err(MarketDataError::NotFound {
                symbol: key.symbol.clone(),
            });
        }
        Ok(series)
    }
}

fn midnight(date: chrono::NaiveDate) -> i64 {
    date.and_hms_opt(0, 0, 0)
        .map(|d| d.and_utc().timestamp())
        .unwrap_or_default()
}

/// Chart API interval. There is no native 4h interval, so hourly bars are
/// fetched and aggregated.
fn interval(timeframe: Timeframe) -> &'static str {
    match timeframe {
        Timeframe::M1 => "1m",
        Timeframe::M5 => "5m",
        Timeframe::M15 => "15m",
        Timeframe::M30 => "30m",
        Timeframe::H1 | Timeframe::H4 => "60m",
        Timeframe::D1 => "1d",
        Timeframe::W1 => "1wk",
    }
}

/// Map common FX and crypto spellings to Yahoo tickers.
///
/// `^GSPC` and `EURUSD=X` pass through; `EUR/USD` becomes `EURUSD=X`;
/// `BTCUSD`, `BTC/USDT` and `btc_usd` become `BTC-USD` style pairs; anything
/// else is upper-cased.
pub fn normalize_symbol(symbol: &str) -> String {
    let s = symbol.trim();
    if s.is_empty() || s.starts_with('^') || s.ends_with("=X") {
        return s.to_string();
    }

    let upper: String = s.to_uppercase().chars().filter(|c| *c != ' ').collect();
    if upper.split('-').count() == 2 {
        return upper;
    }

    let merged: String = upper
        .chars()
        .filter(|c| !matches!(c, '/' | '_' | '-'))
        .collect();
    if merged.len() == 6 && merged.chars().all(|c| c.is_ascii_alphabetic()) {
        let (base, quote) = merged.split_at(3);
        if CRYPTO_BASES.contains(&base) || CRYPTO_QUOTES.contains(&quote) {
            return format!("{base}-{quote}");
        }
        return format!("{base}{quote}=X");
    }

    for sep in ['/', '_'] {
        if upper.contains(sep) {
            let parts: Vec<&str> = upper.split(sep).filter(|p| !p.is_empty()).collect();
            if parts.len() == 2 && (2..=5).contains(&parts[1].len()) {
                return format!("{}-{}", parts[0], parts[1]);
            }
        }
    }

    upper
}

#[derive(Deserialize)]
struct ChartEnvelope {
    chart: Chart,
}

#[derive(Deserialize)]
struct Chart {
    #[serde(default)]
    result: Option<Vec<ChartResult>>,
    #[serde(default)]
    error: Option<ChartError>,
}

#[derive(Deserialize)]
struct ChartError {
    #[serde(default)]
    code: String,
    #[serde(default)]
    description: String,
}

#[derive(Deserialize)]
struct ChartResult {
    #[serde(default)]
    timestamp: Vec<i64>,
    indicators: ChartIndicators,
}

#[derive(Deserialize)]
struct ChartIndicators {
    quote: Vec<Quote>,
}

#[derive(Deserialize)]
struct Quote {
    #[serde(default)]
    open: Vec<Option<f64>>,
    #[serde(default)]
    high: Vec<Option<f64>>,
    #[serde(default)]
    low: Vec<Option<f64>>,
    #[serde(default)]
    close: Vec<Option<f64>>,
    #[serde(default)]
    volume: Vec<Option<f64>>,
}

/// Decode a chart API body. Rows with any missing price are skipped;
/// a missing volume is read as zero.
pub fn parse_chart(body: &str, symbol: &str) -> Result<Vec<Bar>, MarketDataError> {
    let envelope: ChartEnvelope =
        serde_json::from_str(body).map_err(|e| MarketDataError::Malformed {
            reason: format!("chart response: {e}"),
        })?;

    if let Some(err) = envelope.chart.error {
        return Err(if err.code.eq_ignore_ascii_case("not found") {
            MarketDataError::NotFound {
                symbol: symbol.to_string(),
            }
        } else {
            MarketDataError::Unavailable {
                reason: format!("{}: {}", err.code, err.description),
            }
        });
    }

    let Some(result) = envelope.chart.result.and_then(|r| r.into_iter().next()) else {
        return Err(MarketDataError::NotFound {
            symbol: symbol.to_string(),
        });
    };
    let Some(quote) = result.indicators.quote.into_iter().next() else {
        return Err(MarketDataError::Malformed {
            reason: "chart response has no quote block".into(),
        });
    };

    let at = |v: &Vec<Option<f64>>, i: usize| v.get(i).copied().flatten();
    let mut bars = Vec::with_capacity(result.timestamp.len());
    for (i, ts) in result.timestamp.iter().enumerate() {
        let Some(timestamp) = DateTime::<Utc>::from_timestamp(*ts, 0) else {
            return Err(MarketDataError::Malformed {
                reason: format!("timestamp {ts} out of range"),
            });
        };
        let (Some(open), Some(high), Some(low), Some(close)) = (
            at(&quote.open, i),
            at(&quote.high, i),
            at(&quote.low, i),
            at(&quote.close, i),
        ) else {
            continue;
        };
        bars.push(Bar {
            timestamp,
            open,
            high,
            low,
            close,
            volume: at(&quote.volume, i).unwrap_or(0.0),
        });
    }
    Ok(bars)
}

/// Aggregate bars into fixed buckets of `timeframe`, aligned to the epoch.
pub fn resample(bars: &[Bar], timeframe: Timeframe) -> Vec<Bar> {
    let bucket = Duration::minutes(i64::from(timeframe.minutes())).num_seconds();
    let mut out: Vec<Bar> = Vec::new();
    let mut current_bucket = None;

    for bar in bars {
        let ts = bar.timestamp.timestamp();
        let start = ts - ts.rem_euclid(bucket);
        match out.last_mut() {
            Some(last) if current_bucket == Some(start) => {
                last.high = last.high.max(bar.high);
                last.low = last.low.min(bar.low);
                last.close = bar.close;
                last.volume += bar.volume;
            }
            _ => {
                let Some(timestamp) = DateTime::<Utc>::from_timestamp(start, 0) else {
                    continue;
                };
                current_bucket = Some(start);
                out.push(Bar { timestamp, ..bar.clone() });
            }
        }
    }
    out
}
