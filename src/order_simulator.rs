use crate::models::{Candle, OrderSide, OrderType, Signal, SimulatedFill};

/// Decides whether a pending signal fills against a candle and at what price.
///
/// Market orders take the worst price inside the candle (high for BUY, low
/// for SELL). Limit orders fill only if the candle traded through the limit,
/// at the better of the limit and the close. The configured slippage
/// percentage is then applied against the trader on every executed fill.
pub struct OrderSimulator;

impl OrderSimulator {
    pub fn simulate(
        signal: &Signal,
        candle: &Candle,
        slippage_pct: f64,
        commission_rate: f64,
    ) -> SimulatedFill {
        if !(signal.quantity.is_finite() && signal.quantity > 0.0) {
            return SimulatedFill::rejected(format!(
                "invalid {} quantity {}",
                signal.side.as_str(),
                signal.quantity
            ));
        }

        let (base_price, base_slippage) = match signal.order_type {
            OrderType::Market => Self::market_price(signal.side, candle),
            OrderType::Limit => match Self::limit_price(signal, candle) {
                Ok(price) => (price, 0.0),
                Err(reason) => return SimulatedFill::rejected(reason),
            },
        };

        let adjustment = base_price * slippage_pct;
        let execution_price = match signal.side {
            OrderSide::Buy => base_price + adjustment,
            OrderSide::Sell => base_price - adjustment,
        };
        let value = execution_price * signal.quantity;

        SimulatedFill {
            executed: true,
            execution_price,
            executed_quantity: signal.quantity,
            commission: value * commission_rate,
            value,
            slippage: base_slippage + adjustment,
            reason: None,
        }
    }

    fn market_price(side: OrderSide, candle: &Candle) -> (f64, f64) {
        match side {
            OrderSide::Buy => (candle.high, (candle.high - candle.close).max(0.0)),
            OrderSide::Sell => (candle.low, (candle.close - candle.low).max(0.0)),
        }
    }

    fn limit_price(signal: &Signal, candle: &Candle) -> Result<f64, String> {
        let limit = signal.price;
        match signal.side {
            OrderSide::Buy if candle.low <= limit => Ok(limit.min(candle.close)),
            OrderSide::Sell if candle.high >= limit => Ok(limit.max(candle.close)),
            side => Err(format!(
                "limit {} at {} not reached within candle range {}-{}",
                side.as_str(),
                limit,
                candle.low,
                candle.high
            )),
        }
    }
}
