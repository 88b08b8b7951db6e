use crate::config::BacktestConfig;
use anyhow::{anyhow, Result as AnyResult};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

/// Schema version stamped on every persisted result.
pub const RESULT_SCHEMA_VERSION: &str = "1.0.0";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub symbol: String,
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CandleInterval {
    #[serde(rename = "1m")]
    OneMinute,
    #[serde(rename = "3m")]
    ThreeMinutes,
    #[serde(rename = "5m")]
    FiveMinutes,
    #[serde(rename = "15m")]
    FifteenMinutes,
    #[serde(rename = "30m")]
    ThirtyMinutes,
    #[serde(rename = "1h")]
    OneHour,
    #[serde(rename = "2h")]
    TwoHours,
    #[serde(rename = "4h")]
    FourHours,
    #[serde(rename = "6h")]
    SixHours,
    #[serde(rename = "8h")]
    EightHours,
    #[serde(rename = "12h")]
    TwelveHours,
    #[serde(rename = "1d")]
    OneDay,
    #[serde(rename = "3d")]
    ThreeDays,
    #[serde(rename = "1w")]
    OneWeek,
}

impl CandleInterval {
    pub const ALL: [CandleInterval; 14] = [
        CandleInterval::OneMinute,
        CandleInterval::ThreeMinutes,
        CandleInterval::FiveMinutes,
        CandleInterval::FifteenMinutes,
        CandleInterval::ThirtyMinutes,
        CandleInterval::OneHour,
        CandleInterval::TwoHours,
        CandleInterval::FourHours,
        CandleInterval::SixHours,
        CandleInterval::EightHours,
        CandleInterval::TwelveHours,
        CandleInterval::OneDay,
        CandleInterval::ThreeDays,
        CandleInterval::OneWeek,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CandleInterval::OneMinute => "1m",
            CandleInterval::ThreeMinutes => "3m",
            CandleInterval::FiveMinutes => "5m",
            CandleInterval::FifteenMinutes => "15m",
            CandleInterval::ThirtyMinutes => "30m",
            CandleInterval::OneHour => "1h",
            CandleInterval::TwoHours => "2h",
            CandleInterval::FourHours => "4h",
            CandleInterval::SixHours => "6h",
            CandleInterval::EightHours => "8h",
            CandleInterval::TwelveHours => "12h",
            CandleInterval::OneDay => "1d",
            CandleInterval::ThreeDays => "3d",
            CandleInterval::OneWeek => "1w",
        }
    }

    pub fn minutes(&self) -> i64 {
        match self {
            CandleInterval::OneMinute => 1,
            CandleInterval::ThreeMinutes => 3,
            CandleInterval::FiveMinutes => 5,
            CandleInterval::FifteenMinutes => 15,
            CandleInterval::ThirtyMinutes => 30,
            CandleInterval::OneHour => 60,
            CandleInterval::TwoHours => 120,
            CandleInterval::FourHours => 240,
            CandleInterval::SixHours => 360,
            CandleInterval::EightHours => 480,
            CandleInterval::TwelveHours => 720,
            CandleInterval::OneDay => 1_440,
            CandleInterval::ThreeDays => 4_320,
            CandleInterval::OneWeek => 10_080,
        }
    }

    pub fn duration(&self) -> Duration {
        Duration::minutes(self.minutes())
    }
}

impl fmt::Display for CandleInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CandleInterval {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> AnyResult<Self> {
        let trimmed = raw.trim();
        CandleInterval::ALL
            .iter()
            .copied()
            .find(|interval| interval.as_str() == trimmed)
            .ok_or_else(|| {
                anyhow!(
                    "Unsupported candle interval {} (expected one of 1m,3m,5m,15m,30m,1h,2h,4h,6h,8h,12h,1d,3d,1w)",
                    trimmed
                )
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderType {
    Market,
    Limit,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::Market => "MARKET",
            OrderType::Limit => "LIMIT",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Signal {
    pub side: OrderSide,
    pub order_type: OrderType,
    pub price: f64,
    pub quantity: f64,
    pub grid_level: Option<u32>,
    pub timestamp: DateTime<Utc>,
}

impl Signal {
    pub fn market(side: OrderSide, price: f64, quantity: f64, timestamp: DateTime<Utc>) -> Self {
        Self {
            side,
            order_type: OrderType::Market,
            price,
            quantity,
            grid_level: None,
            timestamp,
        }
    }

    pub fn limit(side: OrderSide, price: f64, quantity: f64, timestamp: DateTime<Utc>) -> Self {
        Self {
            side,
            order_type: OrderType::Limit,
            price,
            quantity,
            grid_level: None,
            timestamp,
        }
    }

    pub fn with_grid_level(mut self, grid_level: u32) -> Self {
        self.grid_level = Some(grid_level);
        self
    }
}

/// Signals returned by a strategy for one symbol on one tick.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TradeSignals {
    pub buy: Vec<Signal>,
    pub sell: Vec<Signal>,
}

impl TradeSignals {
    pub fn is_empty(&self) -> bool {
        self.buy.is_empty() && self.sell.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulatedFill {
    pub executed: bool,
    pub execution_price: f64,
    pub executed_quantity: f64,
    pub commission: f64,
    pub value: f64,
    /// Per-unit price movement against the trader (market/limit adjustment plus configured slippage).
    pub slippage: f64,
    pub reason: Option<String>,
}

impl SimulatedFill {
    pub fn rejected(reason: String) -> Self {
        Self {
            executed: false,
            execution_price: 0.0,
            executed_quantity: 0.0,
            commission: 0.0,
            value: 0.0,
            slippage: 0.0,
            reason: Some(reason),
        }
    }
}

/// One executed fill. Quantity is positive for BUY and negative for SELL;
/// value is the quote cash flow (negative for BUY, positive for SELL).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trade {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub price: f64,
    pub quantity: f64,
    pub value: f64,
    pub commission: f64,
    pub profit: Option<f64>,
    pub grid_level: Option<u32>,
    pub execution_price: f64,
    pub slippage: f64,
    pub candle_time: DateTime<Utc>,
}

impl Trade {
    pub fn notional(&self) -> f64 {
        self.value.abs()
    }
}

pub fn generate_trade_id(sequence: usize, symbol: &str, side: OrderSide) -> String {
    format!(
        "trade-{:06}-{}-{}",
        sequence,
        symbol.replace('/', ""),
        side.as_str().to_lowercase()
    )
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortfolioSnapshot {
    pub timestamp: DateTime<Utc>,
    pub total_value: f64,
    pub base_balances: BTreeMap<String, f64>,
    pub quote_balance: f64,
    pub unrealized_pnl: f64,
    pub realized_pnl: f64,
    pub drawdown: f64,
    pub drawdown_percent: f64,
}

/// Ratios can be infinite (profit factor without losses, Sortino without
/// downside). JSON has no such number, so they are written as strings and
/// `null` reads back as +inf.
pub mod ratio_serde {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RatioRepr {
        Number(f64),
        Text(String),
    }

    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        if value.is_nan() {
            serializer.serialize_str("NaN")
        } else if *value == f64::INFINITY {
            serializer.serialize_str("Infinity")
        } else if *value == f64::NEG_INFINITY {
            serializer.serialize_str("-Infinity")
        } else {
            serializer.serialize_f64(*value)
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        match Option::<RatioRepr>::deserialize(deserializer)? {
            None => Ok(f64::INFINITY),
            Some(RatioRepr::Number(value)) => Ok(value),
            Some(RatioRepr::Text(text)) => match text.as_str() {
                "Infinity" => Ok(f64::INFINITY),
                "-Infinity" => Ok(f64::NEG_INFINITY),
                "NaN" => Ok(f64::NAN),
                other => Err(D::Error::custom(format!("invalid ratio value {}", other))),
            },
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SymbolPerformance {
    pub symbol: String,
    pub total_trades: usize,
    pub buy_trades: usize,
    pub sell_trades: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,
    pub win_rate: f64,
    pub gross_profit: f64,
    pub gross_loss: f64,
    pub net_profit: f64,
    pub net_profit_percent: f64,
    pub total_commission: f64,
    pub average_win: f64,
    pub average_loss: f64,
    pub largest_win: f64,
    pub largest_loss: f64,
    #[serde(with = "ratio_serde")]
    pub profit_factor: f64,
    pub max_consecutive_wins: usize,
    pub max_consecutive_losses: usize,
    #[serde(with = "ratio_serde")]
    pub sharpe_ratio: f64,
    pub average_trade_size: f64,
    pub total_volume: f64,
    pub holding_period_return: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceMetrics {
    pub initial_balance: f64,
    pub final_balance: f64,
    pub total_return: f64,
    pub total_return_percent: f64,
    pub annualized_return: f64,
    pub max_drawdown: f64,
    pub max_drawdown_percent: f64,
    pub max_drawdown_duration_secs: i64,
    pub volatility: f64,
    #[serde(with = "ratio_serde")]
    pub sharpe_ratio: f64,
    #[serde(with = "ratio_serde")]
    pub sortino_ratio: f64,
    #[serde(with = "ratio_serde")]
    pub calmar_ratio: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradingMetrics {
    pub total_trades: usize,
    pub buy_trades: usize,
    pub sell_trades: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,
    pub win_rate: f64,
    #[serde(with = "ratio_serde")]
    pub profit_factor: f64,
    pub total_commission: f64,
    pub total_volume: f64,
    pub average_trade_size: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncounteredError {
    pub timestamp: DateTime<Utc>,
    pub symbol: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionDiagnostics {
    pub elapsed_ms: u64,
    pub data_points_processed: usize,
    pub ticks_processed: usize,
    pub rejected_fills: usize,
    pub errors_encountered: Vec<EncounteredError>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultMetadata {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BacktestResult {
    pub config: BacktestConfig,
    pub performance: PerformanceMetrics,
    pub trading: TradingMetrics,
    pub symbol_performance: BTreeMap<String, SymbolPerformance>,
    pub snapshots: Vec<PortfolioSnapshot>,
    pub trades: Vec<Trade>,
    pub diagnostics: ExecutionDiagnostics,
    pub metadata: ResultMetadata,
}

impl BacktestResult {
    pub fn final_balance(&self) -> f64 {
        self.performance.final_balance
    }

    pub fn total_trades(&self) -> usize {
        self.trading.total_trades
    }

    pub fn summary_table(&self) -> String {
        format!(
            r#"
======================================================
               BACKTEST RESULTS
======================================================
Window:           {} -> {}
Symbols:          {}

PERFORMANCE
------------------------------------------------------
Initial Balance:  {:.2}
Final Balance:    {:.2}
Total Return:     {:+.2}%
Annualized:       {:+.2}%
Max Drawdown:     {:.2} ({:.2}%)
Volatility:       {:.6}
Sharpe Ratio:     {:.4}
Sortino Ratio:    {:.4}
Calmar Ratio:     {:.4}

ACTIVITY
------------------------------------------------------
Total Trades:     {} ({} buy / {} sell)
Win Rate:         {:.1}%
Profit Factor:    {:.2}
Commission Paid:  {:.4}
Errors:           {}
======================================================
"#,
            self.config.start_time,
            self.config.end_time,
            self.config.symbols.join(", "),
            self.performance.initial_balance,
            self.performance.final_balance,
            self.performance.total_return_percent,
            self.performance.annualized_return * 100.0,
            self.performance.max_drawdown,
            self.performance.max_drawdown_percent,
            self.performance.volatility,
            self.performance.sharpe_ratio,
            self.performance.sortino_ratio,
            self.performance.calmar_ratio,
            self.trading.total_trades,
            self.trading.buy_trades,
            self.trading.sell_trades,
            self.trading.win_rate * 100.0,
            self.trading.profit_factor,
            self.trading.total_commission,
            self.diagnostics.errors_encountered.len(),
        )
    }
}

/// Latest close price per symbol.
pub type PriceMap = HashMap<String, f64>;
