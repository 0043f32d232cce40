//! Stop-loss, take-profit and trailing-stop levels
//!
//! The trailing stop arms once price has moved in the position's favour: the anchor
//! starts at the entry price and the trigger is only set after the anchor improves on
//! it. From then on the trigger only moves favourably.

use qtrader_core::{ExitReason, Position, RiskConfig, Side};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Fixed exit levels derived from the entry price
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StopLevels {
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
}

impl StopLevels {
    pub fn for_entry(side: Side, entry: Decimal, config: &RiskConfig) -> Self {
        let sign = side.sign();
        let stop_loss = config
            .enable_stop_loss
            .then(|| entry * (Decimal::ONE - sign * config.stop_loss_pct));
        let take_profit = config
            .enable_take_profit
            .then(|| entry * (Decimal::ONE + sign * config.take_profit_pct));
        Self {
            stop_loss,
            take_profit,
        }
    }
}

/// Most favourable of `anchor` and `price` for `side`
pub fn ratchet_anchor(side: Side, anchor: Decimal, price: Decimal) -> Decimal {
    match side {
        Side::Long => anchor.max(price),
        Side::Short => anchor.min(price),
    }
}

/// Trigger price trailing `anchor` by `pct`
pub fn trailing_trigger(side: Side, anchor: Decimal, pct: Decimal) -> Decimal {
    match side {
        Side::Long => anchor * (Decimal::ONE - pct),
        Side::Short => anchor * (Decimal::ONE + pct),
    }
}

/// Ratchet the anchor and trailing trigger of `position` for a new price
///
/// Returns true when the trigger moved.
pub fn update_trailing(position: &mut Position, price: Decimal, config: &RiskConfig) -> bool {
    position.trailing_anchor = ratchet_anchor(position.side, position.trailing_anchor, price);
    if !config.enable_trailing_stop || position.trailing_anchor == position.entry_price {
        return false;
    }

    let trigger = trailing_trigger(
        position.side,
        position.trailing_anchor,
        config.trailing_stop_pct,
    );
    let improved = match (position.side, position.trailing_stop_price) {
        (_, None) => true,
        (Side::Long, Some(current)) => trigger > current,
        (Side::Short, Some(current)) => trigger < current,
    };
    if improved {
        position.trailing_stop_price = Some(trigger);
    }
    improved
}

/// First exit condition met at `price`, checked in the order stop-loss, take-profit,
/// trailing stop
pub fn check_exit(position: &Position, price: Decimal, config: &RiskConfig) -> Option<ExitReason> {
    let adverse = |level: Decimal| match position.side {
        Side::Long => price <= level,
        Side::Short => price >= level,
    };
    let favourable = |level: Decimal| match position.side {
        Side::Long => price >= level,
        Side::Short => price <= level,
    };

    if config.enable_stop_loss && position.stop_loss_price.map_or(false, adverse) {
        return Some(ExitReason::StopLoss);
    }
    if config.enable_take_profit && position.take_profit_price.map_or(false, favourable) {
        return Some(ExitReason::TakeProfit);
    }
    if config.enable_trailing_stop && position.trailing_stop_price.map_or(false, adverse) {
        return Some(ExitReason::TrailingStop);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn position(side: Side, entry: Decimal, config: &RiskConfig) -> Position {
        let levels = StopLevels::for_entry(side, entry, config);
        Position {
            symbol: "BTCUSDT".to_string(),
            side,
            entry_size: dec!(1),
            entry_price: entry,
            leverage: dec!(10),
            stop_loss_price: levels.stop_loss,
            take_profit_price: levels.take_profit,
            trailing_anchor: entry,
            trailing_stop_price: None,
            opened_at: Utc::now(),
            realized_pnl: Decimal::ZERO,
            fees: Decimal::ZERO,
        }
    }

    #[test]
    fn test_levels_for_long_and_short() {
        let config = RiskConfig::default();
        let long = StopLevels::for_entry(Side::Long, dec!(100), &config);
        assert_eq!(long.stop_loss, Some(dec!(98)));
        assert_eq!(long.take_profit, Some(dec!(104)));

        let short = StopLevels::for_entry(Side::Short, dec!(100), &config);
        assert_eq!(short.stop_loss, Some(dec!(102)));
        assert_eq!(short.take_profit, Some(dec!(96)));
    }

    #[test]
    fn test_disabled_levels() {
        let config = RiskConfig {
            enable_stop_loss: false,
            enable_take_profit: false,
            ..Default::default()
        };
        let levels = StopLevels::for_entry(Side::Long, dec!(100), &config);
        assert_eq!(levels.stop_loss, None);
        assert_eq!(levels.take_profit, None);
    }

    #[test]
    fn test_stop_loss_wins_priority() {
        let config = RiskConfig::default();
        let mut p = position(Side::Long, dec!(100), &config);
        // trailing armed and above the price as well
        update_trailing(&mut p, dec!(103), &config);
        assert!(p.trailing_stop_price.is_some());
        assert_eq!(check_exit(&p, dec!(97.9), &config), Some(ExitReason::StopLoss));
    }

    #[test]
    fn test_take_profit_before_trailing() {
        let config = RiskConfig::default();
        let mut p = position(Side::Short, dec!(100), &config);
        update_trailing(&mut p, dec!(95), &config);
        assert_eq!(check_exit(&p, dec!(95.5), &config), Some(ExitReason::TakeProfit));
        assert_eq!(check_exit(&p, dec!(96.5), &config), Some(ExitReason::TrailingStop));
        assert_eq!(check_exit(&p, dec!(95.9), &config), Some(ExitReason::TakeProfit));
    }

    #[test]
    fn test_trailing_trigger_non_decreasing_on_rising_tape() {
        let config = RiskConfig::default();
        let mut p = position(Side::Long, dec!(100), &config);
        let mut last = Decimal::MIN;
        let mut price = dec!(100);
        for step in 0..50 {
            price += if step % 3 == 0 { dec!(0) } else { dec!(0.25) };
            update_trailing(&mut p, price, &config);
            if let Some(trigger) = p.trailing_stop_price {
                assert!(trigger >= last);
                last = trigger;
            }
        }
        assert_eq!(p.trailing_anchor, price);
    }

    #[test]
    fn test_trailing_never_retreats() {
        let config = RiskConfig::default();
        let mut p = position(Side::Long, dec!(100), &config);
        update_trailing(&mut p, dec!(110), &config);
        let armed = p.trailing_stop_price;
        assert_eq!(armed, Some(dec!(108.9)));
        assert!(!update_trailing(&mut p, dec!(105), &config));
        assert_eq!(p.trailing_stop_price, armed);
        assert_eq!(p.trailing_anchor, dec!(110));
    }

    #[test]
    fn test_trailing_not_armed_without_favourable_move() {
        let config = RiskConfig::default();
        let mut p = position(Side::Long, dec!(100), &config);
        assert!(!update_trailing(&mut p, dec!(99), &config));
        assert_eq!(p.trailing_stop_price, None);
        assert_eq!(check_exit(&p, dec!(99), &config), None);
    }
}
