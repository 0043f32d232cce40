//! qtrader learning stack
//!
//! Prioritized replay, value estimation, action policy and state encoding shared by
//! the backtest and live runners.

pub mod features;
pub mod rl;

pub use features::{ReturnWindowConfig, ReturnWindowEncoder, StateEncoder};
pub use rl::*;
