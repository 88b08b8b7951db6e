use crate::error::{BacktestError, BacktestResultOf};
use crate::models::CandleInterval;
use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration as StdDuration;

const DEFAULT_COMMISSION_RATE: f64 = 0.001;
const DEFAULT_SNAPSHOT_INTERVAL_MINUTES: i64 = 60;
const MAX_SNAPSHOT_INTERVAL_MINUTES: i64 = 525_600;
const DEFAULT_MIN_TRADES_FOR_RATIOS: usize = 2;
const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 1_000;
const DEFAULT_PAGE_LIMIT: usize = 1_000;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
const DEFAULT_EXCHANGE_BASE_URL: &str = "https://api.binance.com";
const DEFAULT_CACHE_DIR: &str = "data/cache";

/// How realized profit is measured on SELL fills.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CostBasisPolicy {
    /// Purchase price is not tracked; realized profit is proceeds minus commission.
    #[default]
    Untracked,
    /// Weighted average entry price per symbol.
    AverageCost,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DataSettings {
    pub cache_dir: PathBuf,
    pub use_cache: bool,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub page_limit: usize,
    pub exchange_base_url: String,
    pub request_timeout_secs: u64,
}

impl Default for DataSettings {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from(DEFAULT_CACHE_DIR),
            use_cache: true,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_base_delay_ms: DEFAULT_RETRY_BASE_DELAY_MS,
            page_limit: DEFAULT_PAGE_LIMIT,
            exchange_base_url: DEFAULT_EXCHANGE_BASE_URL.to_string(),
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
        }
    }
}

impl DataSettings {
    pub fn retry_base_delay(&self) -> StdDuration {
        StdDuration::from_millis(self.retry_base_delay_ms)
    }

    pub fn request_timeout(&self) -> StdDuration {
        StdDuration::from_secs(self.request_timeout_secs)
    }
}

/// Backtest run parameters. Immutable once a run starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BacktestConfig {
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub symbols: Vec<String>,
    pub interval: CandleInterval,
    pub initial_balance: f64,
    #[serde(default)]
    pub slippage_pct: f64,
    #[serde(default = "default_max_concurrent_symbols")]
    pub max_concurrent_symbols: usize,
    #[serde(default = "default_commission_rate")]
    pub commission_rate: f64,
    #[serde(default = "default_snapshot_interval_minutes")]
    pub snapshot_interval_minutes: i64,
    /// Annual risk-free rate used by the Sharpe/Sortino ratios.
    #[serde(default)]
    pub risk_free_rate: f64,
    #[serde(default = "default_min_trades_for_ratios")]
    pub min_trades_for_ratios: usize,
    /// Candles handed to `update_state` as recent history; 0 means the strategy's minimum.
    #[serde(default)]
    pub recent_history_len: usize,
    #[serde(default)]
    pub cost_basis: CostBasisPolicy,
    #[serde(default)]
    pub data: DataSettings,
}

fn default_max_concurrent_symbols() -> usize {
    num_cpus::get().max(1)
}

fn default_commission_rate() -> f64 {
    DEFAULT_COMMISSION_RATE
}

fn default_snapshot_interval_minutes() -> i64 {
    DEFAULT_SNAPSHOT_INTERVAL_MINUTES
}

fn default_min_trades_for_ratios() -> usize {
    DEFAULT_MIN_TRADES_FOR_RATIOS
}

impl BacktestConfig {
    pub fn new(
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
        symbols: Vec<String>,
        interval: CandleInterval,
        initial_balance: f64,
    ) -> Self {
        Self {
            start_time,
            end_time,
            symbols,
            interval,
            initial_balance,
            slippage_pct: 0.0,
            max_concurrent_symbols: default_max_concurrent_symbols(),
            commission_rate: DEFAULT_COMMISSION_RATE,
            snapshot_interval_minutes: DEFAULT_SNAPSHOT_INTERVAL_MINUTES,
            risk_free_rate: 0.0,
            min_trades_for_ratios: DEFAULT_MIN_TRADES_FOR_RATIOS,
            recent_history_len: 0,
            cost_basis: CostBasisPolicy::default(),
            data: DataSettings::default(),
        }
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: BacktestConfig = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        Ok(config)
    }

    pub fn snapshot_interval(&self) -> Duration {
        Duration::minutes(self.snapshot_interval_minutes)
    }

    /// Rejects malformed configurations before any work begins.
    pub fn validate(&self) -> BacktestResultOf<()> {
        if self.start_time >= self.end_time {
            return Err(BacktestError::config(format!(
                "startTime ({}) must be before endTime ({})",
                self.start_time, self.end_time
            )));
        }
        if self.symbols.is_empty() {
            return Err(BacktestError::config("symbols must not be empty"));
        }
        let mut seen = std::collections::HashSet::new();
        for symbol in &self.symbols {
            if symbol.trim().is_empty() {
                return Err(BacktestError::config("symbols must not contain blanks"));
            }
            if !seen.insert(symbol.trim().to_uppercase()) {
                return Err(BacktestError::config(format!(
                    "symbol {} is listed more than once",
                    symbol
                )));
            }
        }
        require_range("initialBalance", self.initial_balance, Some(0.0), None)?;
        if self.initial_balance <= 0.0 {
            return Err(BacktestError::config(format!(
                "Setting initialBalance must be > 0 (value: {})",
                self.initial_balance
            )));
        }
        require_range("slippagePct", self.slippage_pct, Some(0.0), Some(1.0))?;
        require_range("commissionRate", self.commission_rate, Some(0.0), Some(1.0))?;
        require_range("riskFreeRate", self.risk_free_rate, Some(0.0), Some(1.0))?;
        if self.max_concurrent_symbols == 0 {
            return Err(BacktestError::config(
                "Setting maxConcurrentSymbols must be >= 1 (value: 0)",
            ));
        }
        if self.snapshot_interval_minutes <= 0 {
            return Err(BacktestError::config(format!(
                "Setting snapshotIntervalMinutes must be >= 1 (value: {})",
                self.snapshot_interval_minutes
            )));
        }
        if self.snapshot_interval_minutes > MAX_SNAPSHOT_INTERVAL_MINUTES {
            return Err(BacktestError::config(format!(
                "Setting snapshotIntervalMinutes must be <= {} (value: {})",
                MAX_SNAPSHOT_INTERVAL_MINUTES, self.snapshot_interval_minutes
            )));
        }
        if self.data.max_retries == 0 {
            return Err(BacktestError::config(
                "Setting data.maxRetries must be >= 1 (value: 0)",
            ));
        }
        if self.data.page_limit == 0 {
            return Err(BacktestError::config(
                "Setting data.pageLimit must be >= 1 (value: 0)",
            ));
        }
        Ok(())
    }
}

fn require_range(key: &str, value: f64, min: Option<f64>, max: Option<f64>) -> BacktestResultOf<()> {
    if !value.is_finite() {
        return Err(BacktestError::config(format!(
            "Setting {} must be finite (value: {})",
            key, value
        )));
    }
    if let Some(min_value) = min {
        if value < min_value {
            return Err(BacktestError::config(format!(
                "Setting {} must be >= {} (value: {})",
                key, min_value, value
            )));
        }
    }
    if let Some(max_value) = max {
        if value > max_value {
            return Err(BacktestError::config(format!(
                "Setting {} must be <= {} (value: {})",
                key, max_value, value
            )));
        }
    }
    Ok(())
}
