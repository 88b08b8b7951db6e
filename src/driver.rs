use crate::candle_utils::trailing_window;
use crate::config::BacktestConfig;
use crate::data_provider::LoadedCandles;
use crate::error::{BacktestError, BacktestResultOf};
use crate::models::{
    generate_trade_id, Candle, EncounteredError, ExecutionDiagnostics, OrderSide,
    PortfolioSnapshot, PriceMap, Signal, Trade,
};
use crate::order_simulator::OrderSimulator;
use crate::portfolio::PortfolioLedger;
use crate::strategy::StrategyEngine;
use chrono::{DateTime, Duration, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverState {
    Initializing,
    Running,
    Cancelled,
    Completed,
}

/// Shared cancellation flag, polled once per simulated minute.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TickProgress {
    pub timestamp: DateTime<Utc>,
    pub tick: usize,
    pub total_ticks: usize,
    pub trades: usize,
    pub portfolio_value: f64,
}

/// Everything the replay produced, handed to analytics.
#[derive(Debug, Clone)]
pub struct SimulationOutcome {
    pub state: DriverState,
    pub trades: Vec<Trade>,
    pub snapshots: Vec<PortfolioSnapshot>,
    pub diagnostics: ExecutionDiagnostics,
    pub final_prices: PriceMap,
}

struct SymbolCursor<'c> {
    symbol: &'c str,
    candles: &'c [Candle],
    next: usize,
}

type ProgressCallback<'a> = Box<dyn FnMut(&TickProgress) + 'a>;

/// Replays candles through the strategy on a synthetic one-minute clock.
///
/// Symbols are visited in the order given on every tick, so identical inputs
/// always produce identical trades and snapshots.
pub struct SimulationDriver<'a> {
    config: &'a BacktestConfig,
    strategy: &'a mut dyn StrategyEngine,
    cancel: CancellationToken,
    progress: Option<ProgressCallback<'a>>,
    state: DriverState,
    ledger: PortfolioLedger,
    trades: Vec<Trade>,
    snapshots: Vec<PortfolioSnapshot>,
    prices: PriceMap,
    diagnostics: ExecutionDiagnostics,
}

impl<'a> SimulationDriver<'a> {
    pub fn new(
        config: &'a BacktestConfig,
        strategy: &'a mut dyn StrategyEngine,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            strategy,
            cancel,
            progress: None,
            state: DriverState::Initializing,
            ledger: PortfolioLedger::new(config.initial_balance, config.cost_basis),
            trades: Vec::new(),
            snapshots: Vec::new(),
            prices: PriceMap::new(),
            diagnostics: ExecutionDiagnostics::default(),
        }
    }

    /// Invoked synchronously after every tick.
    pub fn on_progress<F>(mut self, callback: F) -> Self
    where
        F: FnMut(&TickProgress) + 'a,
    {
        self.progress = Some(Box::new(callback));
        self
    }

    pub fn state(&self) -> DriverState {
        self.state
    }

    /// Runs the replay to completion. `series` must be in config symbol order.
    ///
    /// On cancellation the error is returned; whatever was simulated so far
    /// is still available through `into_outcome`.
    pub fn run(&mut self, series: &[LoadedCandles]) -> BacktestResultOf<()> {
        if self.state != DriverState::Initializing {
            return Err(BacktestError::config(
                "simulation driver has already been run",
            ));
        }
        self.config.validate()?;

        let mut cursors = self.initialize(series)?;
        self.state = DriverState::Running;

        let Some((first, last)) = replay_bounds(&cursors) else {
            info!("No candles left to replay after warm-up");
            self.finish(series_last_timestamp(series));
            return Ok(());
        };

        let total_ticks = ((last - first).num_minutes() + 1).max(1) as usize;
        let snapshot_interval = self.config.snapshot_interval();
        let history_len = self.history_len();
        let mut next_snapshot_at = first;
        let mut clock = first;
        let mut tick = 0usize;

        info!(
            "Replaying {} symbols from {} to {} ({} ticks)",
            cursors.len(),
            first,
            last,
            total_ticks
        );

        while clock <= last {
            if self.cancel.is_cancelled() {
                self.state = DriverState::Cancelled;
                warn!("Backtest cancelled at {}", clock);
                return Err(BacktestError::Cancelled { at: clock });
            }

            for cursor in cursors.iter_mut() {
                while cursor.next < cursor.candles.len()
                    && cursor.candles[cursor.next].timestamp <= clock
                {
                    let index = cursor.next;
                    cursor.next += 1;
                    let recent_history = trailing_window(cursor.candles, index, history_len);
                    self.process_candle(
                        clock,
                        cursor.symbol,
                        &cursor.candles[index],
                        recent_history,
                    )?;
                }
            }

            tick += 1;
            self.diagnostics.ticks_processed = tick;

            if clock >= next_snapshot_at {
                let snapshot = self.ledger.snapshot(clock, &self.prices);
                self.snapshots.push(snapshot);
                while next_snapshot_at <= clock {
                    next_snapshot_at += snapshot_interval;
                }
            }

            if let Some(callback) = self.progress.as_mut() {
                callback(&TickProgress {
                    timestamp: clock,
                    tick,
                    total_ticks,
                    trades: self.trades.len(),
                    portfolio_value: self.ledger.value_at(&self.prices),
                });
            }

            clock += Duration::minutes(1);
        }

        self.finish(Some(last));
        Ok(())
    }

    pub fn into_outcome(self) -> SimulationOutcome {
        SimulationOutcome {
            state: self.state,
            trades: self.trades,
            snapshots: self.snapshots,
            diagnostics: self.diagnostics,
            final_prices: self.prices,
        }
    }

    fn initialize<'s>(
        &mut self,
        series: &'s [LoadedCandles],
    ) -> BacktestResultOf<Vec<SymbolCursor<'s>>> {
        let required = self.strategy.minimum_data_requirement();
        let mut cursors = Vec::with_capacity(series.len());

        for loaded in series {
            let symbol = loaded.symbol.as_str();
            let candles = loaded.candles.as_slice();
            if candles.is_empty() {
                warn!("No candles for {} in the requested window", symbol);
                self.record_error(
                    self.config.start_time,
                    Some(symbol),
                    "no candles in the requested window".to_string(),
                );
                continue;
            }
            if candles.len() < required {
                warn!(
                    "Only {} candles for {}, strategy needs {} to warm up; nothing left to replay",
                    candles.len(),
                    symbol,
                    required
                );
            }

            let warmup = required.min(candles.len());
            self.strategy
                .initialize_strategy(symbol, &candles[..warmup])
                .map_err(|err| BacktestError::SignalGenerationFailure {
                    symbol: symbol.to_string(),
                    message: format!("warm-up failed: {:#}", err),
                })?;
            if let Some(last_warm) = candles[..warmup].last() {
                self.prices.insert(symbol.to_string(), last_warm.close);
            }
            debug!("Warmed up {} with {} candles", symbol, warmup);

            cursors.push(SymbolCursor {
                symbol,
                candles,
                next: warmup,
            });
        }

        Ok(cursors)
    }

    fn history_len(&self) -> usize {
        if self.config.recent_history_len > 0 {
            self.config.recent_history_len
        } else {
            self.strategy.minimum_data_requirement().max(1)
        }
    }

    fn process_candle(
        &mut self,
        clock: DateTime<Utc>,
        symbol: &str,
        candle: &Candle,
        recent_history: &[Candle],
    ) -> BacktestResultOf<()> {
        self.diagnostics.data_points_processed += 1;
        self.prices.insert(symbol.to_string(), candle.close);

        let signals = match self
            .strategy
            .update_state(symbol, candle, recent_history)
            .and_then(|_| self.strategy.get_trade_signals(symbol))
        {
            Ok(signals) => signals,
            Err(err) => {
                let failure = BacktestError::SignalGenerationFailure {
                    symbol: symbol.to_string(),
                    message: format!("{:#}", err),
                };
                warn!("{}", failure);
                self.record_error(clock, Some(symbol), failure.to_string());
                return Ok(());
            }
        };

        for signal in signals.buy.iter().chain(signals.sell.iter()) {
            self.execute_signal(clock, symbol, candle, signal)?;
        }
        Ok(())
    }

    fn execute_signal(
        &mut self,
        clock: DateTime<Utc>,
        symbol: &str,
        candle: &Candle,
        signal: &Signal,
    ) -> BacktestResultOf<()> {
        let fill = OrderSimulator::simulate(
            signal,
            candle,
            self.config.slippage_pct,
            self.config.commission_rate,
        );
        if !fill.executed {
            self.diagnostics.rejected_fills += 1;
            debug!(
                "{} {} signal not filled: {}",
                symbol,
                signal.side.as_str(),
                fill.reason.as_deref().unwrap_or("unknown reason")
            );
            return Ok(());
        }

        let applied = match signal.side {
            OrderSide::Buy => self
                .ledger
                .apply_buy(
                    symbol,
                    fill.executed_quantity,
                    fill.execution_price,
                    fill.commission,
                )
                .map(|_| None),
            OrderSide::Sell => self
                .ledger
                .apply_sell(
                    symbol,
                    fill.executed_quantity,
                    fill.execution_price,
                    fill.commission,
                )
                .map(Some),
        };
        let profit = match applied {
            Ok(profit) => profit,
            Err(err) if err.is_fill_rejection() => {
                self.diagnostics.rejected_fills += 1;
                warn!("Dropping {} fill at {}: {}", symbol, clock, err);
                return Ok(());
            }
            Err(err) => return Err(err),
        };

        let (quantity, value) = match signal.side {
            OrderSide::Buy => (fill.executed_quantity, -fill.value),
            OrderSide::Sell => (-fill.executed_quantity, fill.value),
        };
        self.trades.push(Trade {
            id: generate_trade_id(self.trades.len() + 1, symbol, signal.side),
            timestamp: clock,
            symbol: symbol.to_string(),
            side: signal.side,
            order_type: signal.order_type,
            price: signal.price,
            quantity,
            value,
            commission: fill.commission,
            profit,
            grid_level: signal.grid_level,
            execution_price: fill.execution_price,
            slippage: fill.slippage,
            candle_time: candle.timestamp,
        });
        Ok(())
    }

    fn finish(&mut self, last: Option<DateTime<Utc>>) {
        let final_at = last.unwrap_or(self.config.end_time);
        let already_taken = self
            .snapshots
            .last()
            .map(|snapshot| snapshot.timestamp == final_at)
            .unwrap_or(false);
        if !already_taken {
            let snapshot = self.ledger.snapshot(final_at, &self.prices);
            self.snapshots.push(snapshot);
        }
        self.state = DriverState::Completed;
        info!(
            "Replay completed: {} ticks, {} candles, {} trades, {} rejected fills",
            self.diagnostics.ticks_processed,
            self.diagnostics.data_points_processed,
            self.trades.len(),
            self.diagnostics.rejected_fills
        );
    }

    fn record_error(&mut self, timestamp: DateTime<Utc>, symbol: Option<&str>, message: String) {
        self.diagnostics.errors_encountered.push(EncounteredError {
            timestamp,
            symbol: symbol.map(str::to_string),
            message,
        });
    }
}

fn replay_bounds(cursors: &[SymbolCursor<'_>]) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
    let remaining = cursors
        .iter()
        .filter_map(|cursor| cursor.candles.get(cursor.next..))
        .filter(|rest| !rest.is_empty());
    let mut bounds: Option<(DateTime<Utc>, DateTime<Utc>)> = None;
    for rest in remaining {
        let (first, last) = (rest[0].timestamp, rest[rest.len() - 1].timestamp);
        bounds = Some(match bounds {
            Some((lo, hi)) => (lo.min(first), hi.max(last)),
            None => (first, last),
        });
    }
    bounds
}

fn series_last_timestamp(series: &[LoadedCandles]) -> Option<DateTime<Utc>> {
    series
        .iter()
        .filter_map(|loaded| loaded.candles.last().map(|candle| candle.timestamp))
        .max()
}
