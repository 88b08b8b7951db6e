use crate::models::{Candle, CandleInterval};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::{Client, StatusCode};
use serde_json::Value;
use std::time::Duration;
use tokio::time::sleep;

const KLINES_PATH: &str = "/api/v3/klines";
const MAX_EXCHANGE_LIMIT: usize = 1_000;
const REQUEST_DELAY: Duration = Duration::from_millis(250);

/// Exchange market-data collaborator.
///
/// Implementations return candles oldest-first, at most `limit` of them.
/// Every error is treated as transient and retried by the caller.
#[async_trait]
pub trait CandleSource: Send + Sync {
    async fn get_historical_candles(
        &self,
        symbol: &str,
        interval: CandleInterval,
        start_time: Option<DateTime<Utc>>,
        end_time: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<Candle>>;

    /// Largest page the source serves per request, if it caps `limit`.
    fn max_page_size(&self) -> Option<usize> {
        None
    }
}

pub fn build_async_client(timeout: Option<Duration>) -> Result<Client> {
    let mut builder = Client::builder();
    if let Some(timeout) = timeout {
        builder = builder.timeout(timeout);
    }
    builder.build().context("failed to build HTTP client")
}

/// Reads klines from a Binance-compatible REST endpoint.
pub struct RestCandleSource {
    http: Client,
    base_url: String,
}

impl RestCandleSource {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let base_url = base_url.trim().trim_end_matches('/').to_string();
        if base_url.is_empty() {
            return Err(anyhow!("Exchange base URL must not be empty"));
        }
        Ok(Self {
            http: build_async_client(Some(timeout))?,
            base_url,
        })
    }
}

#[async_trait]
impl CandleSource for RestCandleSource {
    async fn get_historical_candles(
        &self,
        symbol: &str,
        interval: CandleInterval,
        start_time: Option<DateTime<Utc>>,
        end_time: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<Candle>> {
        sleep(REQUEST_DELAY).await;
        let mut query = vec![
            ("symbol", exchange_symbol(symbol)),
            ("interval", interval.as_str().to_string()),
            ("limit", limit.clamp(1, MAX_EXCHANGE_LIMIT).to_string()),
        ];
        if let Some(start) = start_time {
            query.push(("startTime", start.timestamp_millis().to_string()));
        }
        if let Some(end) = end_time {
            query.push(("endTime", end.timestamp_millis().to_string()));
        }

        let url = format!("{}{}", self.base_url, KLINES_PATH);
        let response = self
            .http
            .get(&url)
            .query(&query)
            .send()
            .await
            .with_context(|| format!("GET {} for {} failed", url, symbol))?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(anyhow!("exchange rate limited request for {}", symbol));
        }
        let rows: Vec<Vec<Value>> = response
            .error_for_status()
            .with_context(|| format!("GET {} for {} returned {}", url, symbol, status))?
            .json()
            .await
            .context("failed to parse klines response")?;

        rows.iter()
            .map(|row| parse_kline(symbol, row))
            .collect::<Result<Vec<_>>>()
    }

    fn max_page_size(&self) -> Option<usize> {
        Some(MAX_EXCHANGE_LIMIT)
    }
}

/// `BTC/USDT` -> `BTCUSDT`.
pub fn exchange_symbol(symbol: &str) -> String {
    symbol
        .trim()
        .chars()
        .filter(|ch| ch.is_ascii_alphanumeric())
        .collect::<String>()
        .to_uppercase()
}

fn parse_kline(symbol: &str, row: &[Value]) -> Result<Candle> {
    if row.len() < 6 {
        return Err(anyhow!(
            "kline row for {} has {} fields, expected at least 6",
            symbol,
            row.len()
        ));
    }
    let open_time = row[0]
        .as_i64()
        .ok_or_else(|| anyhow!("kline open time for {} is not an integer", symbol))?;
    let timestamp = Utc
        .timestamp_millis_opt(open_time)
        .single()
        .ok_or_else(|| anyhow!("kline open time {} out of range", open_time))?;

    Ok(Candle {
        symbol: symbol.to_string(),
        timestamp,
        open: number_field(&row[1], "open")?,
        high: number_field(&row[2], "high")?,
        low: number_field(&row[3], "low")?,
        close: number_field(&row[4], "close")?,
        volume: number_field(&row[5], "volume")?,
    })
}

fn number_field(value: &Value, field: &str) -> Result<f64> {
    let parsed = match value {
        Value::String(raw) => raw.trim().parse::<f64>().ok(),
        Value::Number(number) => number.as_f64(),
        _ => None,
    };
    parsed
        .filter(|number| number.is_finite())
        .ok_or_else(|| anyhow!("kline {} value {} is not a number", field, value))
}
