//! qtrader Backtest
//!
//! Replays a recorded tick tape through the same agent and execution engine the
//! live runner uses, against a simulated exchange with fees and slippage.

pub mod config;
pub mod data_loader;
pub mod error;
pub mod exchange;
pub mod results;
pub mod runner;

pub use config::{BacktestConfig, FeeConfig, SlippageConfig, SlippageModel};
pub use data_loader::TapeLoader;
pub use error::{BacktestError, Result};
pub use exchange::SimulatedExchange;
pub use results::{BacktestResults, ReplayCounts, SymbolPerformance};
pub use runner::BacktestRunner;
