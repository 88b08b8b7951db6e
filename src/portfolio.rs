use crate::config::CostBasisPolicy;
use crate::error::{BacktestError, BacktestResultOf};
use crate::models::{PortfolioSnapshot, PriceMap};
use chrono::{DateTime, Utc};
use log::debug;
use std::collections::BTreeMap;

const BALANCE_EPSILON: f64 = 1e-9;

/// Quote and per-symbol base balances for one run.
///
/// The ledger is the only place balances change. Fills that would push a
/// balance negative are rejected before any state is touched.
#[derive(Debug, Clone)]
pub struct PortfolioLedger {
    initial_balance: f64,
    quote_balance: f64,
    base_balances: BTreeMap<String, f64>,
    average_costs: BTreeMap<String, f64>,
    realized_pnl: f64,
    high_water_mark: Option<f64>,
    cost_basis: CostBasisPolicy,
}

impl PortfolioLedger {
    pub fn new(initial_balance: f64, cost_basis: CostBasisPolicy) -> Self {
        Self {
            initial_balance,
            quote_balance: initial_balance,
            base_balances: BTreeMap::new(),
            average_costs: BTreeMap::new(),
            realized_pnl: 0.0,
            high_water_mark: None,
            cost_basis,
        }
    }

    pub fn quote_balance(&self) -> f64 {
        self.quote_balance
    }

    pub fn base_balance(&self, symbol: &str) -> f64 {
        self.base_balances.get(symbol).copied().unwrap_or(0.0)
    }

    pub fn realized_pnl(&self) -> f64 {
        self.realized_pnl
    }

    pub fn apply_buy(
        &mut self,
        symbol: &str,
        quantity: f64,
        price: f64,
        commission: f64,
    ) -> BacktestResultOf<()> {
        let required = quantity * price + commission;
        if self.quote_balance + BALANCE_EPSILON < required {
            return Err(BacktestError::InsufficientFunds {
                symbol: symbol.to_string(),
                quantity,
                required,
                available: self.quote_balance,
            });
        }

        let held = self.base_balance(symbol);
        if self.cost_basis == CostBasisPolicy::AverageCost {
            let previous_cost = self.average_costs.get(symbol).copied().unwrap_or(0.0) * held;
            let new_quantity = held + quantity;
            if new_quantity > 0.0 {
                self.average_costs.insert(
                    symbol.to_string(),
                    (previous_cost + quantity * price + commission) / new_quantity,
                );
            }
        }

        self.quote_balance = (self.quote_balance - required).max(0.0);
        self.base_balances
            .insert(symbol.to_string(), held + quantity);
        Ok(())
    }

    /// Returns the realized profit of the sale under the configured cost-basis policy.
    pub fn apply_sell(
        &mut self,
        symbol: &str,
        quantity: f64,
        price: f64,
        commission: f64,
    ) -> BacktestResultOf<f64> {
        let held = self.base_balance(symbol);
        if held + BALANCE_EPSILON < quantity {
            return Err(BacktestError::InsufficientPosition {
                symbol: symbol.to_string(),
                requested: quantity,
                available: held,
            });
        }

        let proceeds = quantity * price;
        let cost_basis = match self.cost_basis {
            CostBasisPolicy::Untracked => 0.0,
            CostBasisPolicy::AverageCost => {
                self.average_costs.get(symbol).copied().unwrap_or(0.0) * quantity
            }
        };
        let realized = proceeds - commission - cost_basis;

        let remaining = held - quantity;
        if remaining.abs() <= BALANCE_EPSILON {
            self.base_balances.insert(symbol.to_string(), 0.0);
            self.average_costs.remove(symbol);
        } else {
            self.base_balances.insert(symbol.to_string(), remaining);
        }
        self.quote_balance += proceeds - commission;
        self.realized_pnl += realized;
        Ok(realized)
    }

    /// Mark-to-market value: quote balance plus every base balance at its price,
    /// summed in symbol order.
    pub fn value_at(&self, prices: &PriceMap) -> f64 {
        let mut total = self.quote_balance;
        for (symbol, balance) in &self.base_balances {
            if *balance == 0.0 {
                continue;
            }
            match prices.get(symbol) {
                Some(price) => total += balance * price,
                None => debug!("No price for {} while valuing portfolio", symbol),
            }
        }
        total
    }

    pub fn snapshot(&mut self, timestamp: DateTime<Utc>, prices: &PriceMap) -> PortfolioSnapshot {
        let total_value = self.value_at(prices);
        let peak = match self.high_water_mark {
            Some(previous) if previous >= total_value => previous,
            _ => total_value,
        };
        self.high_water_mark = Some(peak);

        let drawdown = (peak - total_value).max(0.0);
        let drawdown_percent = if peak > 0.0 {
            drawdown / peak * 100.0
        } else {
            0.0
        };

        PortfolioSnapshot {
            timestamp,
            total_value,
            base_balances: self.base_balances.clone(),
            quote_balance: self.quote_balance,
            unrealized_pnl: total_value - self.initial_balance - self.realized_pnl,
            realized_pnl: self.realized_pnl,
            drawdown,
            drawdown_percent,
        }
    }
}
