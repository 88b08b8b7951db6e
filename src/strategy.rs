use crate::models::*;
use anyhow::Result;
use std::collections::HashMap;

/// Signal-generation collaborator driven by the simulation loop.
///
/// Calls for one symbol arrive in timestamp order. Errors from
/// `update_state` or `get_trade_signals` skip that symbol's tick and are
/// recorded on the run; they never abort it.
pub trait StrategyEngine: Send {
    fn initialize_strategy(&mut self, symbol: &str, candles: &[Candle]) -> Result<()>;
    fn update_state(
        &mut self,
        symbol: &str,
        candle: &Candle,
        recent_history: &[Candle],
    ) -> Result<()>;
    fn get_trade_signals(&mut self, symbol: &str) -> Result<TradeSignals>;
    /// Candles consumed by `initialize_strategy` before replay starts.
    fn minimum_data_requirement(&self) -> usize;
}

#[path = "strategies/buy_and_hold.rs"]
pub mod buy_and_hold;

pub use buy_and_hold::BuyAndHoldStrategy;

pub fn create_strategy(
    template_id: &str,
    parameters: HashMap<String, f64>,
) -> Result<Box<dyn StrategyEngine>> {
    match template_id {
        "buy_and_hold" => Ok(Box::new(BuyAndHoldStrategy::new(parameters)?)),
        _ => Err(anyhow::anyhow!(
            "Unknown strategy template: {}",
            template_id
        )),
    }
}
