//! Per-step reward signal

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

/// Equity change over the step, as a fraction of the starting balance
pub fn step_reward(prev_equity: Decimal, equity: Decimal, initial_balance: Decimal) -> f64 {
    if initial_balance <= Decimal::ZERO {
        return 0.0;
    }
    ((equity - prev_equity) / initial_balance)
        .to_f64()
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_step_reward() {
        assert!((step_reward(dec!(10000), dec!(10050), dec!(10000)) - 0.005).abs() < 1e-12);
        assert!((step_reward(dec!(10000), dec!(9900), dec!(10000)) + 0.01).abs() < 1e-12);
        assert_eq!(step_reward(dec!(1), dec!(2), Decimal::ZERO), 0.0);
    }
}
