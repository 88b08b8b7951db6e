pub mod backtester;
pub mod cache;
pub mod candle_utils;
pub mod config;
pub mod data_provider;
pub mod driver;
pub mod error;
pub mod exchange;
pub mod models;
pub mod order_simulator;
pub mod performance;
pub mod portfolio;
pub mod report;
pub mod retry;
pub mod strategy;

pub use backtester::{Backtester, ReportedBacktest};
pub use config::BacktestConfig;
pub use driver::{CancellationToken, DriverState, SimulationDriver, TickProgress};
pub use error::{BacktestError, BacktestResultOf};
pub use models::BacktestResult;
