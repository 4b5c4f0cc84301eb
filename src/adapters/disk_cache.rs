//! On-disk CSV layer in front of another market data provider.
//!
//! Layout: `{cache_dir}/{SYMBOL}_{timeframe}_{start}_{end}.csv`. Writes go to
//! a `.tmp` file and are renamed into place, so a reader never sees a
//! partial file. A failed write is logged and the fetched series is still
//! returned.

use async_trait::async_trait;
use std::path::{Path, PathBuf};

use crate::adapters::csv_adapter::{parse_bars, write_bars};
use crate::domain::error::MarketDataError;
use crate::domain::ohlcv::MarketSeries;
use crate::domain::request::SeriesKey;
use crate::ports::market_data_port::MarketDataProvider;

pub struct DiskCachedProvider<P> {
    inner: P,
    cache_dir: PathBuf,
}

impl<P: MarketDataProvider> DiskCachedProvider<P> {
    pub fn new(inner: P, cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            inner,
            cache_dir: cache_dir.into(),
        }
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    fn path_for(&self, key: &SeriesKey) -> PathBuf {
        self.cache_dir.join(format!("{}.csv", key.file_stem()))
    }

    async fn load(&self, path: &Path, key: &SeriesKey) -> Option<MarketSeries> {
        let content = tokio::fs::read_to_string(path).await.ok()?;
        match parse_bars(&content, path) {
            Ok(bars) if !bars.is_empty() => Some(MarketSeries::new(key.clone(), bars)),
            Ok(_) => None,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "ignoring corrupt cache file");
                None
            }
        }
    }

    async fn store(&self, path: &Path, series: &MarketSeries) -> Result<(), String> {
        let bytes = write_bars(&series.bars).map_err(|e| e.to_string())?;
        tokio::fs::create_dir_all(&self.cache_dir)
            .await
            .map_err(|e| format!("failed to create {}: {e}", self.cache_dir.display()))?;
        let tmp_path = path.with_extension("csv.tmp");
        tokio::fs::write(&tmp_path, bytes)
            .await
            .map_err(|e| format!("failed to write {}: {e}", tmp_path.display()))?;
        if let Err(e) = tokio::fs::rename(&tmp_path, path).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(format!("atomic rename failed: {e}"));
        }
        Ok(())
    }
}

#[async_trait]
impl<P: MarketDataProvider> MarketDataProvider for DiskCachedProvider<P> {
    async fn fetch(&self, key: &SeriesKey) -> Result<MarketSeries, MarketDataError> {
        let path = self.path_for(key);
        if let Some(series) = self.load(&path, key).await {
            tracing::debug!(%key, path = %path.display(), "disk cache hit");
            return Ok(series);
        }

        let series = self.inner.fetch(key).await?;
        if let Err(reason) = self.store(&path, &series).await {
            tracing::warn!(%key, %reason, "could not write disk cache");
        }
        Ok(series)
    }
}
