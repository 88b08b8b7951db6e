use crate::cache::CandleCache;
use crate::candle_utils::normalize_candle_series;
use crate::config::DataSettings;
use crate::error::{BacktestError, BacktestResultOf};
use crate::exchange::CandleSource;
use crate::models::{Candle, CandleInterval};
use crate::retry::{retry_with_backoff, RetryPolicy};
use anyhow::{anyhow, Result};
use chrono::{DateTime, Duration, Utc};
use futures::stream::{self, StreamExt, TryStreamExt};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;

const MAX_PAGES: usize = 100_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataOrigin {
    Cache,
    Exchange,
}

#[derive(Debug, Clone)]
pub struct LoadedCandles {
    pub symbol: String,
    pub candles: Vec<Candle>,
    pub source: DataOrigin,
    pub load_time_ms: u64,
}

/// Loads candle ranges, cache first, retrying the exchange on failure.
pub struct HistoricalDataProvider {
    source: Arc<dyn CandleSource>,
    cache: Option<CandleCache>,
    retry: RetryPolicy,
    page_limit: usize,
}

impl HistoricalDataProvider {
    pub fn new(
        source: Arc<dyn CandleSource>,
        cache: Option<CandleCache>,
        retry: RetryPolicy,
        page_limit: usize,
    ) -> Self {
        let mut page_limit = page_limit.max(1);
        if let Some(cap) = source.max_page_size() {
            if page_limit > cap {
                warn!(
                    "Page limit {} exceeds the source maximum of {}, using {}",
                    page_limit, cap, cap
                );
                page_limit = cap.max(1);
            }
        }
        Self {
            source,
            cache,
            retry,
            page_limit,
        }
    }

    pub fn from_settings(source: Arc<dyn CandleSource>, settings: &DataSettings) -> Self {
        let cache = if settings.use_cache {
            Some(CandleCache::new(settings.cache_dir.clone()))
        } else {
            None
        };
        Self::new(
            source,
            cache,
            RetryPolicy::new(settings.max_retries, settings.retry_base_delay()),
            settings.page_limit,
        )
    }

    pub async fn load(
        &self,
        symbol: &str,
        interval: CandleInterval,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
    ) -> BacktestResultOf<LoadedCandles> {
        if end_time <= start_time {
            return Err(BacktestError::config(format!(
                "endTime ({}) must be after startTime ({}) when loading {}",
                end_time, start_time, symbol
            )));
        }
        let started = Instant::now();
        let key = CandleCache::get_cache_key(symbol, interval, start_time, end_time);

        if let Some(cache) = &self.cache {
            match cache.check_cache(&key).await {
                Ok(Some(candles)) => {
                    return Ok(LoadedCandles {
                        symbol: symbol.to_string(),
                        candles,
                        source: DataOrigin::Cache,
                        load_time_ms: started.elapsed().as_millis() as u64,
                    });
                }
                Ok(None) => {}
                Err(err) => warn!("Ignoring unreadable cache entry {}: {:#}", key, err),
            }
        }

        let context = format!("loading {} {} candles", symbol, interval);
        let candles = retry_with_backoff(self.retry, &context, |_| {
            self.fetch_range(symbol, interval, start_time, end_time)
        })
        .await
        .map_err(|exhausted| BacktestError::DataUnavailable {
            symbol: symbol.to_string(),
            attempts: exhausted.attempts,
            reason: format!("{:#}", exhausted.last_error),
        })?;

        if let Some(cache) = &self.cache {
            if let Err(err) = cache.store_cache(&key, &candles).await {
                warn!("Failed to store cache entry {}: {:#}", key, err);
            }
        }

        let load_time_ms = started.elapsed().as_millis() as u64;
        info!(
            "Fetched {} candles for {} from exchange in {}ms",
            candles.len(),
            symbol,
            load_time_ms
        );
        Ok(LoadedCandles {
            symbol: symbol.to_string(),
            candles,
            source: DataOrigin::Exchange,
            load_time_ms,
        })
    }

    /// Loads every symbol with at most `max_concurrent` fetches in flight.
    /// Results keep the order of `symbols`; the first failure aborts.
    pub async fn load_all(
        &self,
        symbols: &[String],
        interval: CandleInterval,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
        max_concurrent: usize,
    ) -> BacktestResultOf<Vec<LoadedCandles>> {
        stream::iter(symbols.iter())
            .map(|symbol| self.load(symbol, interval, start_time, end_time))
            .buffered(max_concurrent.max(1))
            .try_collect()
            .await
    }

    async fn fetch_range(
        &self,
        symbol: &str,
        interval: CandleInterval,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
    ) -> Result<Vec<Candle>> {
        let mut collected: Vec<Candle> = Vec::new();
        let mut cursor = start_time;
        let step = interval.duration();

        for _ in 0..MAX_PAGES {
            let page = self
                .source
                .get_historical_candles(
                    symbol,
                    interval,
                    Some(cursor),
                    Some(end_time),
                    self.page_limit,
                )
                .await?;
            let page_len = page.len();
            let Some(last_timestamp) = page.last().map(|candle| candle.timestamp) else {
                break;
            };
            collected.extend(page);

            if page_len < self.page_limit || last_timestamp >= end_time {
                break;
            }
            let next = last_timestamp + step;
            if next <= cursor {
                return Err(anyhow!(
                    "exchange returned non-advancing page for {} at {}",
                    symbol,
                    cursor
                ));
            }
            cursor = next;
        }

        Ok(normalize_candle_series(collected, start_time, end_time))
    }
}

/// Candles needed before `start_time` to cover a warm-up of `bars` candles.
pub fn warmup_start(
    start_time: DateTime<Utc>,
    interval: CandleInterval,
    bars: usize,
) -> DateTime<Utc> {
    start_time - Duration::minutes(interval.minutes() * bars as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration as StdDuration;

    struct MinuteSource {
        calls: AtomicUsize,
        failures_before_success: usize,
        page_cap: Option<usize>,
    }

    impl MinuteSource {
        fn new(failures_before_success: usize) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                failures_before_success,
                page_cap: None,
            }
        }

        fn capped(page_cap: usize) -> Self {
            Self {
                page_cap: Some(page_cap),
                ..Self::new(0)
            }
        }
    }

    #[async_trait]
    impl CandleSource for MinuteSource {
        async fn get_historical_candles(
            &self,
            symbol: &str,
            _interval: CandleInterval,
            start_time: Option<DateTime<Utc>>,
            end_time: Option<DateTime<Utc>>,
            limit: usize,
        ) -> Result<Vec<Candle>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures_before_success {
                return Err(anyhow!("connection reset"));
            }
            let start = start_time.unwrap();
            let end = end_time.unwrap();
            let limit = self.page_cap.map_or(limit, |cap| limit.min(cap));
            let mut candles = Vec::new();
            let mut ts = start;
            while ts <= end && candles.len() < limit {
                candles.push(Candle {
                    symbol: symbol.to_string(),
                    timestamp: ts,
                    open: 10.0,
                    high: 11.0,
                    low: 9.0,
                    close: 10.5,
                    volume: 1.0,
                });
                ts += Duration::minutes(1);
            }
            Ok(candles)
        }

        fn max_page_size(&self) -> Option<usize> {
            self.page_cap
        }
    }

    fn window() -> (DateTime<Utc>, DateTime<Utc>) {
        (
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 9, 0).unwrap(),
        )
    }

    fn provider(
        source: Arc<MinuteSource>,
        cache: Option<CandleCache>,
        page_limit: usize,
    ) -> HistoricalDataProvider {
        HistoricalDataProvider::new(
            source,
            cache,
            RetryPolicy::new(3, StdDuration::ZERO),
            page_limit,
        )
    }

    #[tokio::test]
    async fn pages_through_the_whole_range() {
        let source = Arc::new(MinuteSource::new(0));
        let provider = provider(source.clone(), None, 4);
        let (start, end) = window();
        let loaded = provider
            .load("BTC/USDT", CandleInterval::OneMinute, start, end)
            .await
            .unwrap();
        assert_eq!(loaded.candles.len(), 10);
        assert_eq!(loaded.source, DataOrigin::Exchange);
        assert_eq!(source.calls.load(Ordering::SeqCst), 3);
        assert!(loaded
            .candles
            .windows(2)
            .all(|pair| pair[0].timestamp < pair[1].timestamp));
    }

    #[tokio::test]
    async fn retries_then_caches_result() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(MinuteSource::new(2));
        let provider = provider(source.clone(), Some(CandleCache::new(dir.path())), 1_000);
        let (start, end) = window();

        let first = provider
            .load("BTC/USDT", CandleInterval::OneMinute, start, end)
            .await
            .unwrap();
        assert_eq!(first.source, DataOrigin::Exchange);
        assert_eq!(source.calls.load(Ordering::SeqCst), 3);

        let second = provider
            .load("BTC/USDT", CandleInterval::OneMinute, start, end)
            .await
            .unwrap();
        assert_eq!(second.source, DataOrigin::Cache);
        assert_eq!(second.candles, first.candles);
        assert_eq!(source.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausted_retries_surface_data_unavailable() {
        let source = Arc::new(MinuteSource::new(usize::MAX));
        let provider = provider(source.clone(), None, 1_000);
        let (start, end) = window();
        let err = provider
            .load("ETH/USDT", CandleInterval::OneMinute, start, end)
            .await
            .unwrap_err();
        let message = err.to_string();
        assert!(matches!(err, BacktestError::DataUnavailable { attempts: 3, .. }));
        assert!(message.contains("ETH/USDT"));
        assert!(message.contains("3 attempts"));
        assert_eq!(source.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn rejects_inverted_range() {
        let provider = provider(Arc::new(MinuteSource::new(0)), None, 10);
        let (start, end) = window();
        let err = provider
            .load("BTC/USDT", CandleInterval::OneMinute, end, start)
            .await
            .unwrap_err();
        assert!(matches!(err, BacktestError::ConfigValidation(_)));
    }

    #[tokio::test]
    async fn load_all_preserves_symbol_order() {
        let provider = provider(Arc::new(MinuteSource::new(0)), None, 1_000);
        let (start, end) = window();
        let symbols = vec![
            "C/USDT".to_string(),
            "A/USDT".to_string(),
            "B/USDT".to_string(),
        ];
        let loaded = provider
            .load_all(&symbols, CandleInterval::OneMinute, start, end, 2)
            .await
            .unwrap();
        let order: Vec<&str> = loaded.iter().map(|l| l.symbol.as_str()).collect();
        assert_eq!(order, vec!["C/USDT", "A/USDT", "B/USDT"]);
    }

    #[test]
    fn warmup_start_steps_back_whole_bars() {
        let (start, _) = window();
        let warm = warmup_start(start, CandleInterval::FifteenMinutes, 4);
        assert_eq!(start - warm, Duration::hours(1));
    }

    #[tokio::test]
    async fn page_limit_above_source_cap_still_covers_the_range() {
        let source = Arc::new(MinuteSource::capped(3));
        let provider = provider(source.clone(), None, 1_500);
        let (start, end) = window();
        let loaded = provider
            .load("BTC/USDT", CandleInterval::OneMinute, start, end)
            .await
            .unwrap();
        assert_eq!(loaded.candles.len(), 10);
        assert_eq!(loaded.candles.last().unwrap().timestamp, end);
        assert_eq!(source.calls.load(Ordering::SeqCst), 4);
    }
}
