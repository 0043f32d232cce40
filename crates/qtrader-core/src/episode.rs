//! Episode performance accounting
//!
//! [`EpisodeMetrics`] accumulates during a session and is finalized into an
//! [`EpisodeReport`] at session end. All arithmetic is `Decimal` so identical inputs
//! produce identical reports.

use crate::events::{RiskEvent, TradeRecord};
use crate::traits::ExecutionObserver;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// sqrt(252), annualisation factor for daily-style returns
const SQRT_252: Decimal = dec!(15.874507866387544);

/// Running accumulators for one session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpisodeMetrics {
    initial_balance: Decimal,
    realized_pnl: Decimal,
    fees: Decimal,
    wins: usize,
    losses: usize,
    gross_profit: Decimal,
    gross_loss: Decimal,
    risk_events: usize,
    equity_curve: Vec<(DateTime<Utc>, Decimal)>,
    trades: Vec<TradeRecord>,
}

impl EpisodeMetrics {
    pub fn new(initial_balance: Decimal) -> Self {
        Self {
            initial_balance,
            realized_pnl: Decimal::ZERO,
            fees: Decimal::ZERO,
            wins: 0,
            losses: 0,
            gross_profit: Decimal::ZERO,
            gross_loss: Decimal::ZERO,
            risk_events: 0,
            equity_curve: Vec::new(),
            trades: Vec::new(),
        }
    }

    pub fn record_trade(&mut self, trade: &TradeRecord) {
        let net = trade.net_pnl();
        self.realized_pnl += net;
        self.fees += trade.fees;
        if net > Decimal::ZERO {
            self.wins += 1;
            self.gross_profit += net;
        } else {
            self.losses += 1;
            self.gross_loss += net.abs();
        }
        self.trades.push(trade.clone());
    }

    pub fn record_equity(&mut self, at: DateTime<Utc>, equity: Decimal) {
        self.equity_curve.push((at, equity));
    }

    pub fn record_risk_event(&mut self) {
        self.risk_events += 1;
    }

    pub fn realized_pnl(&self) -> Decimal {
        self.realized_pnl
    }

    pub fn trades(&self) -> &[TradeRecord] {
        &self.trades
    }

    pub fn equity_curve(&self) -> &[(DateTime<Utc>, Decimal)] {
        &self.equity_curve
    }

    pub fn initial_balance(&self) -> Decimal {
        self.initial_balance
    }

    /// Compute the final statistics
    pub fn finalize(&self) -> EpisodeReport {
        let trades = self.wins + self.losses;
        let win_rate = if trades > 0 {
            Decimal::from(self.wins) / Decimal::from(trades)
        } else {
            Decimal::ZERO
        };

        let roi = if self.initial_balance.is_zero() {
            Decimal::ZERO
        } else {
            self.realized_pnl / self.initial_balance
        };

        let profit_factor = if self.gross_loss.is_zero() {
            if self.gross_profit.is_zero() {
                Decimal::ZERO
            } else {
                dec!(999.99)
            }
        } else {
            self.gross_profit / self.gross_loss
        };

        let returns = self.step_returns();
        let final_equity = self
            .equity_curve
            .last()
            .map(|(_, e)| *e)
            .unwrap_or(self.initial_balance + self.realized_pnl);

        EpisodeReport {
            pnl: self.realized_pnl,
            roi,
            sharpe: sharpe_ratio(&returns),
            sortino: sortino_ratio(&returns),
            max_drawdown: max_drawdown(&self.equity_curve),
            win_rate,
            trades,
            wins: self.wins,
            losses: self.losses,
            profit_factor,
            fees: self.fees,
            risk_events: self.risk_events,
            final_equity,
        }
    }

    fn step_returns(&self) -> Vec<Decimal> {
        self.equity_curve
            .windows(2)
            .filter(|w| !w[0].1.is_zero())
            .map(|w| (w[1].1 - w[0].1) / w[0].1)
            .collect()
    }
}

/// Finalized session statistics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpisodeReport {
    /// Realized PnL net of fees
    pub pnl: Decimal,
    /// Realized PnL over initial balance
    pub roi: Decimal,
    pub sharpe: Decimal,
    pub sortino: Decimal,
    /// Largest peak-to-trough equity decline, as a fraction of the peak
    pub max_drawdown: Decimal,
    /// Fraction of trades with positive net PnL
    pub win_rate: Decimal,
    pub trades: usize,
    pub wins: usize,
    pub losses: usize,
    pub profit_factor: Decimal,
    pub fees: Decimal,
    pub risk_events: usize,
    pub final_equity: Decimal,
}

fn mean(values: &[Decimal]) -> Decimal {
    if values.is_empty() {
        return Decimal::ZERO;
    }
    values.iter().sum::<Decimal>() / Decimal::from(values.len())
}

fn sharpe_ratio(returns: &[Decimal]) -> Decimal {
    if returns.len() < 2 {
        return Decimal::ZERO;
    }
    let avg = mean(returns);
    let variance = returns
        .iter()
        .map(|r| {
            let diff = *r - avg;
            diff * diff
        })
        .sum::<Decimal>()
        / Decimal::from(returns.len());
    let std_dev = decimal_sqrt(variance);
    if std_dev.is_zero() {
        return Decimal::ZERO;
    }
    (avg / std_dev * SQRT_252).round_dp(8)
}

fn sortino_ratio(returns: &[Decimal]) -> Decimal {
    if returns.len() < 2 {
        return Decimal::ZERO;
    }
    let avg = mean(returns);
    let downside = returns
        .iter()
        .map(|r| {
            let d = (*r).min(Decimal::ZERO);
            d * d
        })
        .sum::<Decimal>()
        / Decimal::from(returns.len());
    let downside_dev = decimal_sqrt(downside);
    if downside_dev.is_zero() {
        return Decimal::ZERO;
    }
    (avg / downside_dev * SQRT_252).round_dp(8)
}

fn max_drawdown(curve: &[(DateTime<Utc>, Decimal)]) -> Decimal {
    let mut peak = match curve.first() {
        Some((_, e)) => *e,
        None => return Decimal::ZERO,
    };
    let mut worst = Decimal::ZERO;
    for (_, equity) in curve {
        if *equity > peak {
            peak = *equity;
        }
        if peak > Decimal::ZERO {
            let drawdown = (peak - *equity) / peak;
            if drawdown > worst {
                worst = drawdown;
            }
        }
    }
    worst
}

/// Newton-Raphson square root
pub fn decimal_sqrt(n: Decimal) -> Decimal {
    if n.is_zero() || n.is_sign_negative() {
        return Decimal::ZERO;
    }

    let mut x = if n > Decimal::ONE { n / dec!(2) } else { Decimal::ONE };
    for _ in 0..64 {
        let next_x = (x + n / x) / dec!(2);
        if (next_x - x).abs() < dec!(0.000000000001) {
            return next_x;
        }
        x = next_x;
    }
    x
}

/// Shared handle that records engine callbacks into an [`EpisodeMetrics`]
#[derive(Debug, Clone)]
pub struct MetricsRecorder {
    inner: Arc<Mutex<EpisodeMetrics>>,
}

impl MetricsRecorder {
    pub fn new(initial_balance: Decimal) -> Self {
        Self {
            inner: Arc::new(Mutex::new(EpisodeMetrics::new(initial_balance))),
        }
    }

    pub fn record_equity(&self, at: DateTime<Utc>, equity: Decimal) {
        self.inner.lock().record_equity(at, equity);
    }

    pub fn snapshot(&self) -> EpisodeMetrics {
        self.inner.lock().clone()
    }

    pub fn finalize(&self) -> EpisodeReport {
        self.inner.lock().finalize()
    }
}

impl ExecutionObserver for MetricsRecorder {
    fn on_trade_closed(&self, trade: &TradeRecord) {
        self.inner.lock().record_trade(trade);
    }

    fn on_risk_event(&self, _event: &RiskEvent) {
        self.inner.lock().record_risk_event();
    }
}
