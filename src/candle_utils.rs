use crate::models::Candle;
use chrono::{DateTime, Utc};

/// Sorts candles oldest-first, drops duplicate timestamps (first one wins)
/// and anything outside `[start, end]`.
pub fn normalize_candle_series(
    mut candles: Vec<Candle>,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Vec<Candle> {
    candles.retain(|candle| {
        candle.timestamp >= start && candle.timestamp <= end && candle_is_well_formed(candle)
    });
    candles.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
    candles.dedup_by(|later, earlier| later.timestamp == earlier.timestamp);
    candles
}

/// Finite prices with `low <= open, close <= high`.
pub fn candle_is_well_formed(candle: &Candle) -> bool {
    let prices = [candle.open, candle.high, candle.low, candle.close];
    if prices.iter().any(|value| !value.is_finite()) {
        return false;
    }
    candle.low <= candle.high
        && candle.open >= candle.low
        && candle.open <= candle.high
        && candle.close >= candle.low
        && candle.close <= candle.high
}

/// Normalizes a symbol string by trimming whitespace and uppercasing.
pub fn normalize_symbol(value: &str) -> Option<String> {
    let normalized = value.trim().to_uppercase();
    if normalized.is_empty() {
        None
    } else {
        Some(normalized)
    }
}

/// Last `len` candles ending at `index` (inclusive).
pub fn trailing_window(candles: &[Candle], index: usize, len: usize) -> &[Candle] {
    if candles.is_empty() || len == 0 {
        return &[];
    }
    let end = index.min(candles.len() - 1) + 1;
    let start = end.saturating_sub(len);
    &candles[start..end]
}
