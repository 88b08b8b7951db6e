use chrono::{DateTime, Utc};
use thiserror::Error;

pub type BacktestResultOf<T> = std::result::Result<T, BacktestError>;

#[derive(Debug, Error)]
pub enum BacktestError {
    #[error("invalid backtest configuration: {0}")]
    ConfigValidation(String),

    #[error("historical data for {symbol} unavailable after {attempts} attempts: {reason}")]
    DataUnavailable {
        symbol: String,
        attempts: u32,
        reason: String,
    },

    #[error("no historical data available for any configured symbol")]
    NoData,

    #[error(
        "insufficient funds to buy {quantity} {symbol}: required {required:.8}, available {available:.8}"
    )]
    InsufficientFunds {
        symbol: String,
        quantity: f64,
        required: f64,
        available: f64,
    },

    #[error("insufficient position to sell {requested} {symbol}: holding {available}")]
    InsufficientPosition {
        symbol: String,
        requested: f64,
        available: f64,
    },

    #[error("signal generation failed for {symbol}: {message}")]
    SignalGenerationFailure { symbol: String, message: String },

    #[error("backtest cancelled at {at}")]
    Cancelled { at: DateTime<Utc> },
}

impl BacktestError {
    /// Ledger rejections are recovered locally by dropping the fill.
    pub fn is_fill_rejection(&self) -> bool {
        matches!(
            self,
            BacktestError::InsufficientFunds { .. } | BacktestError::InsufficientPosition { .. }
        )
    }

    pub fn config<S: Into<String>>(message: S) -> Self {
        BacktestError::ConfigValidation(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_unavailable_names_symbol_and_attempts() {
        let err = BacktestError::DataUnavailable {
            symbol: "ETH/USDT".to_string(),
            attempts: 3,
            reason: "connection reset".to_string(),
        };
        let message = err.to_string();
        assert!(message.contains("ETH/USDT"));
        assert!(message.contains("3 attempts"));
    }

    #[test]
    fn ledger_errors_are_fill_rejections() {
        let funds = BacktestError::InsufficientFunds {
            symbol: "BTC/USDT".to_string(),
            quantity: 1.0,
            required: 100.0,
            available: 10.0,
        };
        assert!(funds.is_fill_rejection());
        assert!(!BacktestError::NoData.is_fill_rejection());
    }
}
