//! Process-wide market data cache.
//!
//! At most one fetch per [`SeriesKey`] is in flight: concurrent requesters
//! await the same cell. A failed fetch leaves the cell empty, so the next
//! caller retries. Series are handed out as `Arc`s and never mutated.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::OnceCell;

use crate::domain::error::MarketDataError;
use crate::domain::ohlcv::MarketSeries;
use crate::domain::request::SeriesKey;
use crate::ports::market_data_port::MarketDataProvider;

type Cell = Arc<OnceCell<Arc<MarketSeries>>>;

pub struct MarketDataCache {
    provider: Arc<dyn MarketDataProvider>,
    cells: Mutex<HashMap<SeriesKey, Cell>>,
}

impl MarketDataCache {
    pub fn new(provider: Arc<dyn MarketDataProvider>) -> Self {
        Self {
            provider,
            cells: Mutex::new(HashMap::new()),
        }
    }

    fn cell(&self, key: &SeriesKey) -> Cell {
        // A poisoned lock only means another thread panicked mid-insert; the
        // map itself is still usable.
        let mut cells = self.cells.lock().unwrap_or_else(|e| e.into_inner());
        cells.entry(key.clone()).or_default().clone()
    }

    pub async fn get(&self, key: &SeriesKey) -> Result<Arc<MarketSeries>, MarketDataError> {
        let cell = self.cell(key);
        let series = cell
            .get_or_try_init(|| async {
                tracing::info!(%key, "fetching market data");
                let series = self.provider.fetch(key).await?;
                tracing::info!(%key, bars = series.len(), "market data cached");
                Ok::<_, MarketDataError>(Arc::new(series))
            })
            .await?;
        Ok(Arc::clone(series))
    }

    /// Keys with a completed fetch.
    pub fn cached_keys(&self) -> Vec<SeriesKey> {
        let cells = self.cells.lock().unwrap_or_else(|e| e.into_inner());
        let mut keys: Vec<SeriesKey> = cells
            .iter()
            .filter(|(_, cell)| cell.initialized())
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort_by(|a, b| a.file_stem().cmp(&b.file_stem()));
        keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::indicator::test_support::bars_from_closes;
    use crate::domain::request::Timeframe;
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Flaky {
        calls: AtomicUsize,
        fail_first: bool,
    }

    #[async_trait]
    impl MarketDataProvider for Flaky {
        async fn fetch(&self, key: &SeriesKey) -> Result<MarketSeries, MarketDataError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            if self.fail_first && n == 0 {
                return Err(MarketDataError::RateLimited);
            }
            Ok(MarketSeries::new(key.clone(), bars_from_closes(&[1.0, 2.0, 3.0])))
        }
    }

    fn key(symbol: &str) -> SeriesKey {
        SeriesKey::new(
            symbol,
            Timeframe::D1,
            NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(2024, 6, 30).unwrap(),
        )
    }

    #[tokio::test]
    async fn concurrent_requests_share_one_fetch() {
        let provider = Arc::new(Flaky {
            calls: AtomicUsize::new(0),
            fail_first: false,
        });
        let cache = Arc::new(MarketDataCache::new(provider.clone()));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                tokio::spawn(async move { cache.get(&key("AAPL")).await })
            })
            .collect();
        let mut results = Vec::new();
        for h in handles {
            results.push(h.await.unwrap().unwrap());
        }

        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
        assert!(results.iter().all(|s| Arc::ptr_eq(s, &results[0])));
        assert_eq!(cache.cached_keys(), vec![key("AAPL")]);
    }

    #[tokio::test]
    async fn failed_fetch_is_retried_by_the_next_caller() {
        let provider = Arc::new(Flaky {
            calls: AtomicUsize::new(0),
            fail_first: true,
        });
        let cache = MarketDataCache::new(provider.clone());

        let err = cache.get(&key("MSFT")).await.unwrap_err();
        assert_eq!(err, MarketDataError::RateLimited);
        assert!(cache.cached_keys().is_empty());

        let series = cache.get(&key("MSFT")).await.unwrap();
        assert_eq!(series.len(), 3);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn distinct_keys_fetch_separately() {
        let provider = Arc::new(Flaky {
            calls: AtomicUsize::new(0),
            fail_first: false,
        });
        let cache = MarketDataCache::new(provider.clone());
        cache.get(&key("AAPL")).await.unwrap();
        cache.get(&key("MSFT")).await.unwrap();
        cache.get(&key("AAPL")).await.unwrap();
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
    }
}
