use crate::config::BacktestConfig;
use crate::data_provider::{warmup_start, HistoricalDataProvider, LoadedCandles};
use crate::driver::{CancellationToken, SimulationDriver, TickProgress};
use crate::error::{BacktestError, BacktestResultOf};
use crate::exchange::CandleSource;
use crate::models::{BacktestResult, ResultMetadata, RESULT_SCHEMA_VERSION};
use crate::performance::PerformanceCalculator;
use crate::report::ReportSink;
use crate::strategy::StrategyEngine;
use chrono::Utc;
use log::{info, warn};
use std::sync::Arc;
use std::time::Instant;

/// A finished run plus the outcome of persisting it. A failed save never
/// invalidates the result.
pub struct ReportedBacktest {
    pub result: BacktestResult,
    pub report: anyhow::Result<String>,
}

/// Validates, loads, replays and scores one backtest.
pub struct Backtester {
    config: BacktestConfig,
    provider: HistoricalDataProvider,
    cancel: CancellationToken,
}

impl Backtester {
    pub fn new(config: BacktestConfig, source: Arc<dyn CandleSource>) -> Self {
        let provider = HistoricalDataProvider::from_settings(source, &config.data);
        Self::with_provider(config, provider)
    }

    pub fn with_provider(config: BacktestConfig, provider: HistoricalDataProvider) -> Self {
        Self {
            config,
            provider,
            cancel: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &BacktestConfig {
        &self.config
    }

    /// Token that stops the replay at the next simulated minute.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Loads every symbol, reaching back far enough to cover `warmup_bars`.
    pub async fn load_data(&self, warmup_bars: usize) -> BacktestResultOf<Vec<LoadedCandles>> {
        self.config.validate()?;
        let start = warmup_start(self.config.start_time, self.config.interval, warmup_bars);
        let loaded = self
            .provider
            .load_all(
                &self.config.symbols,
                self.config.interval,
                start,
                self.config.end_time,
                self.config.max_concurrent_symbols,
            )
            .await?;

        for entry in &loaded {
            info!(
                "Loaded {} candles for {} from {:?} in {}ms",
                entry.candles.len(),
                entry.symbol,
                entry.source,
                entry.load_time_ms
            );
        }
        if loaded.iter().all(|entry| entry.candles.is_empty()) {
            return Err(BacktestError::NoData);
        }
        Ok(loaded)
    }

    pub async fn run(&self, strategy: &mut dyn StrategyEngine) -> BacktestResultOf<BacktestResult> {
        self.run_with_progress(strategy, |_| {}).await
    }

    pub async fn run_with_progress<F>(
        &self,
        strategy: &mut dyn StrategyEngine,
        progress: F,
    ) -> BacktestResultOf<BacktestResult>
    where
        F: FnMut(&TickProgress),
    {
        let started = Instant::now();
        info!(
            "Starting backtest: {} symbols, {} to {}, interval {}",
            self.config.symbols.len(),
            self.config.start_time,
            self.config.end_time,
            self.config.interval
        );

        let loaded = self.load_data(strategy.minimum_data_requirement()).await?;

        let mut driver = SimulationDriver::new(&self.config, strategy, self.cancel.clone())
            .on_progress(progress);
        driver.run(&loaded)?;
        let outcome = driver.into_outcome();

        let performance = PerformanceCalculator::calculate_performance(
            &self.config,
            &outcome.snapshots,
            outcome.trades.len(),
        );
        let trading = PerformanceCalculator::calculate_trading_metrics(&outcome.trades);
        let symbol_performance = PerformanceCalculator::calculate_symbol_performance(
            &self.config.symbols,
            &outcome.trades,
            self.config.min_trades_for_ratios,
        );

        let mut diagnostics = outcome.diagnostics;
        diagnostics.elapsed_ms = started.elapsed().as_millis() as u64;
        if !diagnostics.errors_encountered.is_empty() {
            warn!(
                "Backtest completed with {} recorded errors",
                diagnostics.errors_encountered.len()
            );
        }
        info!(
            "Backtest finished in {}ms: final balance {:.2} ({:+.2}%), {} trades",
            diagnostics.elapsed_ms,
            performance.final_balance,
            performance.total_return_percent,
            trading.total_trades
        );

        Ok(BacktestResult {
            config: self.config.clone(),
            performance,
            trading,
            symbol_performance,
            snapshots: outcome.snapshots,
            trades: outcome.trades,
            diagnostics,
            metadata: ResultMetadata {
                id: uuid::Uuid::new_v4().to_string(),
                created_at: Utc::now(),
                version: RESULT_SCHEMA_VERSION.to_string(),
            },
        })
    }

    /// Runs and hands the result to `sink`; a save failure is reported, not raised.
    pub async fn run_and_report(
        &self,
        strategy: &mut dyn StrategyEngine,
        sink: &dyn ReportSink,
    ) -> BacktestResultOf<ReportedBacktest> {
        let result = self.run(strategy).await?;
        let report = sink.save(&result).await;
        if let Err(err) = &report {
            warn!("Failed to save backtest report {}: {:#}", result.metadata.id, err);
        }
        Ok(ReportedBacktest { result, report })
    }
}
