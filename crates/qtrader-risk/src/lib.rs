//! qtrader risk management
//!
//! Position sizing, exit levels and the account/feed checks that force a flatten.

pub mod guard;
pub mod sizing;
pub mod stops;

pub use guard::{RiskBreach, RiskGuard};
pub use sizing::{round_down, PositionSizer};
pub use stops::{check_exit, ratchet_anchor, trailing_trigger, update_trailing, StopLevels};
