//! State encoders
//!
//! An encoder turns the tick stream and the current position into the fixed-width
//! tensor the value estimator consumes.

mod return_window;

pub use return_window::{ReturnWindowConfig, ReturnWindowEncoder};

use crate::rl::Tensor;
use qtrader_core::{Position, Tick};
use rust_decimal::Decimal;

/// Encodes market state for one decision
pub trait StateEncoder: Send + Sync {
    fn name(&self) -> &str;

    /// Width of every tensor this encoder produces
    fn state_size(&self) -> usize;

    /// Record a tick; called once per tick before `encode`
    fn observe(&mut self, tick: &Tick);

    fn encode(&self, symbol: &str, price: Decimal, position: Option<&Position>, balance: Decimal) -> Tensor;

    /// Forget all history, e.g. between episodes
    fn reset(&mut self);
}
