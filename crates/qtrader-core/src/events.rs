use crate::types::{Side, Symbol, Tick};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Item produced by a market feed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FeedEvent {
    /// A market data tick
    Tick(Tick),
    /// A detected discontinuity in the feed
    Gap(FeedGap),
}

impl FeedEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            FeedEvent::Tick(_) => "tick",
            FeedEvent::Gap(_) => "feed_gap",
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            FeedEvent::Tick(t) => t.timestamp,
            FeedEvent::Gap(g) => g.detected_at,
        }
    }
}

/// Market data discontinuity
///
/// `symbol` is `None` when the whole subscription went silent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedGap {
    pub symbol: Option<Symbol>,
    /// Timestamp of the last tick received before the gap
    pub last_tick_at: Option<DateTime<Utc>>,
    pub detected_at: DateTime<Utc>,
    /// How long the feed has been silent, in milliseconds
    pub silence_ms: u64,
}

impl FeedGap {
    pub fn affects(&self, symbol: &str) -> bool {
        self.symbol.as_deref().map_or(true, |s| s == symbol)
    }
}

/// Kind of risk event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskEventKind {
    /// Equity fell below the maintenance margin requirement
    MarginCall,
    /// Market data silent beyond the configured threshold
    FeedStale,
    /// Gateway retries exhausted; outcome unknown until reconciled
    PositionStuck,
    /// A position was force-closed
    ForcedFlatten,
    /// An open action was suppressed by sizing rules
    LimitExceeded,
}

impl RiskEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskEventKind::MarginCall => "margin_call",
            RiskEventKind::FeedStale => "feed_stale",
            RiskEventKind::PositionStuck => "position_stuck",
            RiskEventKind::ForcedFlatten => "forced_flatten",
            RiskEventKind::LimitExceeded => "limit_exceeded",
        }
    }

    /// Fatal events flatten the symbol and halt new positions until reset
    pub fn is_fatal(&self) -> bool {
        matches!(self, RiskEventKind::MarginCall | RiskEventKind::FeedStale)
    }
}

impl fmt::Display for RiskEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Risk event reported by the execution engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskEvent {
    pub symbol: Symbol,
    pub kind: RiskEventKind,
    pub detail: String,
    pub at: DateTime<Utc>,
}

impl RiskEvent {
    pub fn new(
        symbol: impl Into<Symbol>,
        kind: RiskEventKind,
        detail: impl Into<String>,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            kind,
            detail: detail.into(),
            at,
        }
    }
}

/// Why a position was closed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    StopLoss,
    TakeProfit,
    TrailingStop,
    /// Explicit close action from the policy
    Signal,
    /// Fatal risk event
    ForcedFlatten,
    SessionEnd,
    /// Exchange reported the position gone during reconciliation
    Reconciled,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::StopLoss => "stop_loss",
            ExitReason::TakeProfit => "take_profit",
            ExitReason::TrailingStop => "trailing_stop",
            ExitReason::Signal => "signal",
            ExitReason::ForcedFlatten => "forced_flatten",
            ExitReason::SessionEnd => "session_end",
            ExitReason::Reconciled => "reconciled",
        }
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A closed (or partially closed) trade
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub symbol: Symbol,
    pub side: Side,
    pub entry_price: Decimal,
    pub exit_price: Decimal,
    pub size: Decimal,
    pub pnl: Decimal,
    pub fees: Decimal,
    pub reason: ExitReason,
    pub opened_at: DateTime<Utc>,
    pub closed_at: DateTime<Utc>,
}

impl TradeRecord {
    /// PnL after fees
    pub fn net_pnl(&self) -> Decimal {
        self.pnl - self.fees
    }

    pub fn is_win(&self) -> bool {
        self.net_pnl() > Decimal::ZERO
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_gap_scope() {
        let all = FeedGap {
            symbol: None,
            last_tick_at: None,
            detected_at: Utc::now(),
            silence_ms: 31_000,
        };
        assert!(all.affects("BTCUSDT"));

        let one = FeedGap {
            symbol: Some("ETHUSDT".to_string()),
            ..all
        };
        assert!(one.affects("ETHUSDT"));
        assert!(!one.affects("BTCUSDT"));
    }

    #[test]
    fn test_fatal_kinds() {
        assert!(RiskEventKind::MarginCall.is_fatal());
        assert!(RiskEventKind::FeedStale.is_fatal());
        assert!(!RiskEventKind::PositionStuck.is_fatal());
        assert!(!RiskEventKind::LimitExceeded.is_fatal());
    }

    #[test]
    fn test_trade_net_pnl() {
        let now = Utc::now();
        let trade = TradeRecord {
            symbol: "BTCUSDT".to_string(),
            side: Side::Long,
            entry_price: dec!(100),
            exit_price: dec!(101),
            size: dec!(1),
            pnl: dec!(1),
            fees: dec!(1.5),
            reason: ExitReason::Signal,
            opened_at: now,
            closed_at: now,
        };
        assert_eq!(trade.net_pnl(), dec!(-0.5));
        assert!(!trade.is_win());
    }
}
