use crate::models::{Candle, CandleInterval};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use log::debug;
use std::io::ErrorKind;
use std::path::PathBuf;
use tokio::fs;

/// File-per-range candle cache. A missing file is a miss, never an error.
///
/// Concurrent runs may share a directory: writes go to a temporary file that
/// is renamed into place, so the last writer wins without torn reads.
#[derive(Debug, Clone)]
pub struct CandleCache {
    root: PathBuf,
}

impl CandleCache {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    pub fn get_cache_key(
        symbol: &str,
        interval: CandleInterval,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> String {
        format!(
            "{}_{}_{}_{}",
            sanitize_symbol(symbol),
            interval.as_str(),
            start.timestamp_millis(),
            end.timestamp_millis()
        )
    }

    pub fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(format!("{}.json", key))
    }

    pub async fn check_cache(&self, key: &str) -> Result<Option<Vec<Candle>>> {
        let path = self.path_for(key);
        let raw = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("Cache miss for {}", key);
                return Ok(None);
            }
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to read cache file {}", path.display()))
            }
        };
        let candles: Vec<Candle> = serde_json::from_slice(&raw)
            .with_context(|| format!("failed to decode cache file {}", path.display()))?;
        debug!("Cache hit for {} ({} candles)", key, candles.len());
        Ok(Some(candles))
    }

    pub async fn store_cache(&self, key: &str, candles: &[Candle]) -> Result<PathBuf> {
        fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("failed to create cache dir {}", self.root.display()))?;
        let path = self.path_for(key);
        let tmp_path = self
            .root
            .join(format!(".{}.{}.tmp", key, uuid::Uuid::new_v4().simple()));
        let payload = serde_json::to_vec(candles).context("failed to encode candles")?;
        fs::write(&tmp_path, payload)
            .await
            .with_context(|| format!("failed to write cache file {}", tmp_path.display()))?;
        if let Err(err) = fs::rename(&tmp_path, &path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(err)
                .with_context(|| format!("failed to move cache file into {}", path.display()));
        }
        Ok(path)
    }
}

fn sanitize_symbol(symbol: &str) -> String {
    symbol
        .trim()
        .chars()
        .map(|ch| if ch.is_ascii_alphanumeric() { ch } else { '-' })
        .collect()
}
