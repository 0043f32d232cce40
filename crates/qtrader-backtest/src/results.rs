//! Backtest results

use chrono::{DateTime, Utc};
use qtrader_core::{EpisodeMetrics, EpisodeReport, Symbol, TradeRecord};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Outcome of one replayed episode
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestResults {
    pub episode: usize,
    pub seed: u64,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub initial_capital: Decimal,
    pub final_equity: Decimal,
    pub ticks: usize,
    pub decisions: u64,
    pub train_steps: u64,
    pub report: EpisodeReport,
    pub trades: Vec<TradeRecord>,
    pub equity_curve: Vec<(DateTime<Utc>, Decimal)>,
    pub symbol_breakdown: BTreeMap<Symbol, SymbolPerformance>,
}

/// Per-symbol slice of the trades
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SymbolPerformance {
    pub trades: u64,
    pub wins: u64,
    pub pnl: Decimal,
    pub fees: Decimal,
}

/// Counters gathered by the runner while replaying
#[derive(Debug, Clone, Copy, Default)]
pub struct ReplayCounts {
    pub ticks: usize,
    pub decisions: u64,
    pub train_steps: u64,
}

impl BacktestResults {
    pub fn from_metrics(
        episode: usize,
        seed: u64,
        metrics: &EpisodeMetrics,
        counts: ReplayCounts,
    ) -> Self {
        let report = metrics.finalize();
        let trades = metrics.trades().to_vec();
        let equity_curve = metrics.equity_curve().to_vec();

        Self {
            episode,
            seed,
            start_time: equity_curve.first().map(|(t, _)| *t),
            end_time: equity_curve.last().map(|(t, _)| *t),
            initial_capital: metrics.initial_balance(),
            final_equity: report.final_equity,
            ticks: counts.ticks,
            decisions: counts.decisions,
            train_steps: counts.train_steps,
            symbol_breakdown: Self::symbol_breakdown(&trades),
            report,
            trades,
            equity_curve,
        }
    }

    fn symbol_breakdown(trades: &[TradeRecord]) -> BTreeMap<Symbol, SymbolPerformance> {
        let mut breakdown: BTreeMap<Symbol, SymbolPerformance> = BTreeMap::new();
        for trade in trades {
            let entry = breakdown.entry(trade.symbol.clone()).or_default();
            entry.trades += 1;
            if trade.is_win() {
                entry.wins += 1;
            }
            entry.pnl += trade.net_pnl();
            entry.fees += trade.fees;
        }
        breakdown
    }

    /// Export results to JSON
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Export trades to CSV format
    pub fn trades_to_csv(&self) -> String {
        let mut csv = String::from(
            "opened_at,closed_at,symbol,side,entry_price,exit_price,size,pnl,fees,reason\n",
        );
        for trade in &self.trades {
            csv.push_str(&format!(
                "{},{},{},{},{},{},{},{},{},{}\n",
                trade.opened_at.to_rfc3339(),
                trade.closed_at.to_rfc3339(),
                trade.symbol,
                trade.side,
                trade.entry_price,
                trade.exit_price,
                trade.size,
                trade.pnl,
                trade.fees,
                trade.reason,
            ));
        }
        csv
    }
}
