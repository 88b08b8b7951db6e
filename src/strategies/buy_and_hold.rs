use crate::models::*;
use anyhow::{anyhow, Result};
use std::collections::{HashMap, HashSet};

const DEFAULT_QUOTE_AMOUNT: f64 = 1_000.0;
// Leaves room for the fill landing at the candle high plus slippage and commission.
const DEFAULT_PRICE_HEADROOM: f64 = 0.01;

/// Buys `quoteAmount` worth of each symbol on its first replayed candle and
/// holds until the end of the run.
pub struct BuyAndHoldStrategy {
    quote_amount: f64,
    price_headroom: f64,
    latest: HashMap<String, Candle>,
    entered: HashSet<String>,
}

impl BuyAndHoldStrategy {
    pub fn new(parameters: HashMap<String, f64>) -> Result<Self> {
        let quote_amount = parameters
            .get("quoteAmount")
            .copied()
            .unwrap_or(DEFAULT_QUOTE_AMOUNT);
        if !(quote_amount.is_finite() && quote_amount > 0.0) {
            return Err(anyhow!(
                "Parameter quoteAmount must be > 0 (value: {})",
                quote_amount
            ));
        }
        let price_headroom = parameters
            .get("priceHeadroom")
            .copied()
            .unwrap_or(DEFAULT_PRICE_HEADROOM);
        if !(0.0..1.0).contains(&price_headroom) {
            return Err(anyhow!(
                "Parameter priceHeadroom must be within [0, 1) (value: {})",
                price_headroom
            ));
        }
        Ok(Self {
            quote_amount,
            price_headroom,
            latest: HashMap::new(),
            entered: HashSet::new(),
        })
    }
}

impl crate::strategy::StrategyEngine for BuyAndHoldStrategy {
    fn initialize_strategy(&mut self, symbol: &str, _candles: &[Candle]) -> Result<()> {
        self.latest.remove(symbol);
        self.entered.remove(symbol);
        Ok(())
    }

    fn update_state(
        &mut self,
        symbol: &str,
        candle: &Candle,
        _recent_history: &[Candle],
    ) -> Result<()> {
        self.latest.insert(symbol.to_string(), candle.clone());
        Ok(())
    }

    fn get_trade_signals(&mut self, symbol: &str) -> Result<TradeSignals> {
        if self.entered.contains(symbol) {
            return Ok(TradeSignals::default());
        }
        let Some(candle) = self.latest.get(symbol) else {
            return Ok(TradeSignals::default());
        };
        if candle.high <= 0.0 {
            return Err(anyhow!(
                "cannot size entry for {}: non-positive price {}",
                symbol,
                candle.high
            ));
        }

        let quantity = self.quote_amount / (candle.high * (1.0 + self.price_headroom));
        self.entered.insert(symbol.to_string());
        Ok(TradeSignals {
            buy: vec![Signal::market(
                OrderSide::Buy,
                candle.close,
                quantity,
                candle.timestamp,
            )],
            sell: Vec::new(),
        })
    }

    fn minimum_data_requirement(&self) -> usize {
        0
    }
}
