//! Runner status reported over the health endpoint

use crate::types::{Symbol, TradingMode};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Progress counters of a running session
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunnerCounters {
    pub ticks: u64,
    pub decisions: u64,
    pub feed_gaps: u64,
    pub train_steps: u64,
    pub exploration_rate: f64,
    pub equity: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunnerStatus {
    pub mode: TradingMode,
    pub symbols: Vec<Symbol>,
    pub running: bool,
    pub feed_connected: bool,
    pub halted_symbols: Vec<Symbol>,
    pub started_at: Option<DateTime<Utc>>,
    pub metrics: RunnerCounters,
}

impl RunnerStatus {
    pub fn new(mode: TradingMode, symbols: Vec<Symbol>) -> Self {
        Self {
            mode,
            symbols,
            running: false,
            feed_connected: false,
            halted_symbols: Vec::new(),
            started_at: None,
            metrics: RunnerCounters::default(),
        }
    }

    /// Running with a live feed and no halted symbols
    pub fn is_healthy(&self) -> bool {
        self.running && self.feed_connected && self.halted_symbols.is_empty()
    }
}
