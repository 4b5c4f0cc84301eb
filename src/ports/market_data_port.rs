//! Historical price source port.

use async_trait::async_trait;

use crate::domain::error::MarketDataError;
use crate::domain::ohlcv::MarketSeries;
use crate::domain::request::SeriesKey;

/// Fetches the bars of a closed date range. Results for a key never change,
/// so callers may cache them indefinitely.
#[async_trait]
pub trait MarketDataProvider: Send + Sync {
    async fn fetch(&self, key: &SeriesKey) -> Result<MarketSeries, MarketDataError>;
}
