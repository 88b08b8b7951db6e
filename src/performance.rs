use crate::config::BacktestConfig;
use crate::models::*;
use statrs::statistics::Statistics;
use std::collections::BTreeMap;

const SECONDS_PER_YEAR: f64 = 365.0 * 24.0 * 60.0 * 60.0;
const MINUTES_PER_YEAR: f64 = 365.0 * 24.0 * 60.0;
const DRAWDOWN_EPSILON: f64 = 1e-12;

struct DrawdownInfo {
    max_drawdown: f64,
    max_drawdown_percent: f64,
    max_duration_secs: i64,
}

pub struct PerformanceCalculator;

impl PerformanceCalculator {
    /// Time-window metrics over the snapshot series.
    pub fn calculate_performance(
        config: &BacktestConfig,
        snapshots: &[PortfolioSnapshot],
        trade_count: usize,
    ) -> PerformanceMetrics {
        let initial_balance = config.initial_balance;
        let final_balance = snapshots
            .last()
            .map(|snapshot| snapshot.total_value)
            .filter(|value| value.is_finite())
            .unwrap_or(initial_balance);

        let total_return = final_balance - initial_balance;
        let total_return_percent = if initial_balance > 0.0 {
            total_return / initial_balance * 100.0
        } else {
            0.0
        };

        let annualized_return = Self::calculate_annualized_return(
            initial_balance,
            final_balance,
            (config.end_time - config.start_time).num_seconds(),
        );
        let drawdown = Self::calculate_max_drawdown(snapshots);

        let returns = Self::period_returns(snapshots);
        let volatility = Self::sample_std_dev(&returns);
        let periods_per_year = MINUTES_PER_YEAR / config.snapshot_interval_minutes.max(1) as f64;
        let period_risk_free = config.risk_free_rate / periods_per_year;

        let sharpe_ratio = if trade_count < config.min_trades_for_ratios {
            0.0
        } else {
            Self::calculate_sharpe_ratio(&returns, volatility, period_risk_free)
        };
        let sortino_ratio = Self::calculate_sortino_ratio(&returns, period_risk_free);
        let calmar_ratio =
            Self::calculate_calmar_ratio(annualized_return, drawdown.max_drawdown_percent);

        PerformanceMetrics {
            initial_balance,
            final_balance,
            total_return,
            total_return_percent,
            annualized_return,
            max_drawdown: drawdown.max_drawdown,
            max_drawdown_percent: drawdown.max_drawdown_percent,
            max_drawdown_duration_secs: drawdown.max_duration_secs,
            volatility,
            sharpe_ratio,
            sortino_ratio,
            calmar_ratio,
        }
    }

    /// One record per configured symbol, in symbol order.
    pub fn calculate_symbol_performance(
        symbols: &[String],
        trades: &[Trade],
        min_trades_for_ratios: usize,
    ) -> BTreeMap<String, SymbolPerformance> {
        symbols
            .iter()
            .map(|symbol| {
                let symbol_trades: Vec<&Trade> =
                    trades.iter().filter(|trade| &trade.symbol == symbol).collect();
                (
                    symbol.clone(),
                    Self::symbol_performance(symbol, &symbol_trades, min_trades_for_ratios),
                )
            })
            .collect()
    }

    pub fn symbol_performance(
        symbol: &str,
        trades: &[&Trade],
        min_trades_for_ratios: usize,
    ) -> SymbolPerformance {
        if trades.is_empty() {
            return SymbolPerformance {
                symbol: symbol.to_string(),
                ..SymbolPerformance::default()
            };
        }

        let outcomes = SellOutcomes::collect(trades.iter().copied());
        let buy_trades = trades.iter().filter(|t| t.side == OrderSide::Buy).count();
        let total_commission: f64 = trades.iter().map(|t| t.commission).sum();
        let total_volume: f64 = trades.iter().map(|t| t.notional()).sum();
        let net_profit = trades.iter().map(|t| t.value).sum::<f64>() - total_commission;
        let first_buy_notional = trades
            .iter()
            .find(|t| t.side == OrderSide::Buy)
            .map(|t| t.notional())
            .unwrap_or(0.0);
        let net_profit_percent = if first_buy_notional > 0.0 {
            net_profit / first_buy_notional * 100.0
        } else {
            0.0
        };

        let trade_returns: Vec<f64> = trades
            .iter()
            .filter(|t| t.side == OrderSide::Sell && t.notional() > 0.0)
            .map(|t| t.profit.unwrap_or(0.0) / t.notional())
            .collect();
        let sharpe_ratio = if trade_returns.len() < min_trades_for_ratios.max(2) {
            0.0
        } else {
            let volatility = Self::sample_std_dev(&trade_returns);
            Self::calculate_sharpe_ratio(&trade_returns, volatility, 0.0)
        };

        let first_price = trades[0].execution_price;
        let last_price = trades[trades.len() - 1].execution_price;
        let holding_period_return = if first_price > 0.0 {
            (last_price - first_price) / first_price
        } else {
            0.0
        };

        SymbolPerformance {
            symbol: symbol.to_string(),
            total_trades: trades.len(),
            buy_trades,
            sell_trades: outcomes.sells,
            winning_trades: outcomes.wins.len(),
            losing_trades: outcomes.losses.len(),
            win_rate: outcomes.win_rate(),
            gross_profit: outcomes.gross_profit(),
            gross_loss: outcomes.gross_loss(),
            net_profit,
            net_profit_percent,
            total_commission,
            average_win: Self::average(&outcomes.wins),
            average_loss: Self::average(&outcomes.losses),
            largest_win: outcomes.wins.iter().copied().fold(0.0, f64::max),
            largest_loss: outcomes.losses.iter().copied().fold(0.0, f64::max),
            profit_factor: Self::calculate_profit_factor(
                trades.len(),
                outcomes.gross_profit(),
                outcomes.gross_loss(),
            ),
            max_consecutive_wins: outcomes.max_consecutive_wins,
            max_consecutive_losses: outcomes.max_consecutive_losses,
            sharpe_ratio,
            average_trade_size: total_volume / trades.len() as f64,
            total_volume,
            holding_period_return,
        }
    }

    pub fn calculate_trading_metrics(trades: &[Trade]) -> TradingMetrics {
        if trades.is_empty() {
            return TradingMetrics::default();
        }
        let outcomes = SellOutcomes::collect(trades.iter());
        let total_volume: f64 = trades.iter().map(|t| t.notional()).sum();

        TradingMetrics {
            total_trades: trades.len(),
            buy_trades: trades.iter().filter(|t| t.side == OrderSide::Buy).count(),
            sell_trades: outcomes.sells,
            winning_trades: outcomes.wins.len(),
            losing_trades: outcomes.losses.len(),
            win_rate: outcomes.win_rate(),
            profit_factor: Self::calculate_profit_factor(
                trades.len(),
                outcomes.gross_profit(),
                outcomes.gross_loss(),
            ),
            total_commission: trades.iter().map(|t| t.commission).sum(),
            total_volume,
            average_trade_size: total_volume / trades.len() as f64,
        }
    }

    /// `+inf` with profit and no losses, 0 with no trades.
    pub fn calculate_profit_factor(total_trades: usize, gross_profit: f64, gross_loss: f64) -> f64 {
        if total_trades == 0 {
            return 0.0;
        }
        if gross_loss > 0.0 {
            gross_profit / gross_loss
        } else if gross_profit > 0.0 {
            f64::INFINITY
        } else {
            0.0
        }
    }

    fn calculate_annualized_return(
        initial_balance: f64,
        final_balance: f64,
        elapsed_secs: i64,
    ) -> f64 {
        if initial_balance <= 0.0 || elapsed_secs <= 0 {
            return 0.0;
        }
        let ratio = final_balance / initial_balance;
        if ratio <= 0.0 {
            return -1.0;
        }
        let years = elapsed_secs as f64 / SECONDS_PER_YEAR;
        ratio.powf(1.0 / years) - 1.0
    }

    fn period_returns(snapshots: &[PortfolioSnapshot]) -> Vec<f64> {
        snapshots
            .windows(2)
            .map(|window| {
                let prev = window[0].total_value;
                let curr = window[1].total_value;
                if prev > 0.0 {
                    (curr - prev) / prev
                } else {
                    0.0
                }
            })
            .collect()
    }

    fn sample_std_dev(values: &[f64]) -> f64 {
        if values.len() < 2 {
            return 0.0;
        }
        let std_dev = values.std_dev();
        if std_dev.is_finite() {
            std_dev
        } else {
            0.0
        }
    }

    fn calculate_sharpe_ratio(returns: &[f64], volatility: f64, period_risk_free: f64) -> f64 {
        if returns.is_empty() || volatility <= 0.0 {
            return 0.0;
        }
        (returns.mean() - period_risk_free) / volatility
    }

    /// Downside deviation is the root mean square of the negative returns only.
    fn calculate_sortino_ratio(returns: &[f64], period_risk_free: f64) -> f64 {
        if returns.is_empty() {
            return 0.0;
        }
        let mean = returns.mean();
        let downside: Vec<f64> = returns.iter().copied().filter(|r| *r < 0.0).collect();
        if downside.is_empty() {
            return if mean >= 0.0 { f64::INFINITY } else { 0.0 };
        }
        let downside_deviation =
            (downside.iter().map(|r| r * r).sum::<f64>() / downside.len() as f64).sqrt();
        if downside_deviation <= 0.0 {
            return 0.0;
        }
        (mean - period_risk_free) / downside_deviation
    }

    fn calculate_calmar_ratio(annualized_return: f64, max_drawdown_percent: f64) -> f64 {
        if !annualized_return.is_finite() || !max_drawdown_percent.is_finite() {
            return 0.0;
        }
        let drawdown_ratio = (max_drawdown_percent / 100.0).abs();
        if drawdown_ratio <= f64::EPSILON {
            return 0.0;
        }
        annualized_return / drawdown_ratio
    }

    fn calculate_max_drawdown(snapshots: &[PortfolioSnapshot]) -> DrawdownInfo {
        let mut info = DrawdownInfo {
            max_drawdown: 0.0,
            max_drawdown_percent: 0.0,
            max_duration_secs: 0,
        };
        let Some(first) = snapshots.first() else {
            return info;
        };

        let mut peak_value = first.total_value;
        let mut peak_time = first.timestamp;
        for snapshot in snapshots {
            if snapshot.total_value >= peak_value - DRAWDOWN_EPSILON {
                peak_value = peak_value.max(snapshot.total_value);
                peak_time = snapshot.timestamp;
                continue;
            }
            let drawdown = peak_value - snapshot.total_value;
            let drawdown_percent = if peak_value > 0.0 {
                drawdown / peak_value * 100.0
            } else {
                0.0
            };
            info.max_drawdown = info.max_drawdown.max(drawdown);
            info.max_drawdown_percent = info.max_drawdown_percent.max(drawdown_percent);
            info.max_duration_secs = info
                .max_duration_secs
                .max((snapshot.timestamp - peak_time).num_seconds());
        }
        info
    }

    fn average(values: &[f64]) -> f64 {
        if values.is_empty() {
            0.0
        } else {
            values.iter().sum::<f64>() / values.len() as f64
        }
    }
}

/// Realized SELL profits split into wins and losses (losses as magnitudes).
struct SellOutcomes {
    sells: usize,
    wins: Vec<f64>,
    losses: Vec<f64>,
    max_consecutive_wins: usize,
    max_consecutive_losses: usize,
}

impl SellOutcomes {
    fn collect<'t>(trades: impl Iterator<Item = &'t Trade>) -> Self {
        let mut outcomes = SellOutcomes {
            sells: 0,
            wins: Vec::new(),
            losses: Vec::new(),
            max_consecutive_wins: 0,
            max_consecutive_losses: 0,
        };
        let (mut win_streak, mut loss_streak) = (0usize, 0usize);

        for trade in trades.filter(|t| t.side == OrderSide::Sell) {
            outcomes.sells += 1;
            let profit = trade.profit.unwrap_or(0.0);
            if profit > 0.0 {
                outcomes.wins.push(profit);
                win_streak += 1;
                loss_streak = 0;
            } else if profit < 0.0 {
                outcomes.losses.push(-profit);
                loss_streak += 1;
                win_streak = 0;
            } else {
                win_streak = 0;
                loss_streak = 0;
            }
            outcomes.max_consecutive_wins = outcomes.max_consecutive_wins.max(win_streak);
            outcomes.max_consecutive_losses = outcomes.max_consecutive_losses.max(loss_streak);
        }
        outcomes
    }

    fn gross_profit(&self) -> f64 {
        self.wins.iter().sum()
    }

    fn gross_loss(&self) -> f64 {
        self.losses.iter().sum()
    }

    fn win_rate(&self) -> f64 {
        if self.sells == 0 {
            0.0
        } else {
            self.wins.len() as f64 / self.sells as f64
        }
    }
}
