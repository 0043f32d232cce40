//! Backtest configuration

use qtrader_core::Symbol;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// Configuration for a backtest run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BacktestConfig {
    /// Initial capital in quote currency
    pub initial_capital: Decimal,
    /// Fee configuration
    pub fees: FeeConfig,
    /// Slippage configuration
    pub slippage: SlippageConfig,
    /// Seed for policy exploration and replay sampling
    pub seed: u64,
    /// Decisions between training steps; 0 disables training
    pub train_interval: u64,
    /// Ticks per symbol fed to the encoder before the first decision
    pub warmup_ticks: usize,
    /// Restrict the tape to these symbols; all symbols on the tape when empty
    pub symbols: Vec<Symbol>,
}

impl Default for BacktestConfig {
    fn default() -> Self {
        Self {
            initial_capital: dec!(10000),
            fees: FeeConfig::default(),
            slippage: SlippageConfig::default(),
            seed: 42,
            train_interval: 4,
            warmup_ticks: 16,
            symbols: Vec::new(),
        }
    }
}

/// Fee configuration for simulated fills
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeeConfig {
    /// Trading fee as a fraction of notional (e.g., 0.0006 for 0.06%)
    pub trading_fee_pct: Decimal,
    /// Minimum fee per fill
    pub min_fee: Decimal,
}

impl Default for FeeConfig {
    fn default() -> Self {
        Self {
            trading_fee_pct: dec!(0.0006),
            min_fee: Decimal::ZERO,
        }
    }
}

/// Slippage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SlippageConfig {
    /// Slippage model to use
    pub model: SlippageModel,
    /// Base slippage as a fraction of price
    pub base_slippage_pct: Decimal,
    /// Notional at which size-proportional slippage doubles the base
    pub reference_notional: Decimal,
}

impl Default for SlippageConfig {
    fn default() -> Self {
        Self {
            model: SlippageModel::Fixed,
            base_slippage_pct: dec!(0.0005),
            reference_notional: dec!(10000),
        }
    }
}

/// Slippage models
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlippageModel {
    /// Fill at the tape price
    None,
    /// Fixed fraction against the taker
    Fixed,
    /// Fixed fraction scaled up with order notional
    SizeProportional,
}
