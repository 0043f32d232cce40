//! Account and feed risk checks

use qtrader_core::{Account, FeedConfig, RiskConfig, RiskEventKind};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

/// A breached risk rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskBreach {
    pub kind: RiskEventKind,
    pub detail: String,
}

/// Detects conditions that force a flatten
#[derive(Debug, Clone)]
pub struct RiskGuard {
    maintenance_margin_ratio: Decimal,
    gap_threshold: Duration,
}

impl RiskGuard {
    pub fn new(risk: &RiskConfig, feed: &FeedConfig) -> Self {
        Self {
            maintenance_margin_ratio: risk.maintenance_margin_ratio,
            gap_threshold: feed.gap_threshold(),
        }
    }

    pub fn gap_threshold(&self) -> Duration {
        self.gap_threshold
    }

    /// Margin call when equity covers less than the maintenance ratio of used margin
    pub fn assess_account(&self, account: &Account) -> Option<RiskBreach> {
        if account.used_margin <= Decimal::ZERO {
            return None;
        }
        let ratio = account.equity / account.used_margin;
        if ratio < self.maintenance_margin_ratio {
            warn!(
                equity = %account.equity,
                used_margin = %account.used_margin,
                ratio = %ratio,
                "Margin call"
            );
            return Some(RiskBreach {
                kind: RiskEventKind::MarginCall,
                detail: format!(
                    "equity {} is {} of used margin {}, below maintenance {}",
                    account.equity, ratio.round_dp(4), account.used_margin, self.maintenance_margin_ratio
                ),
            });
        }
        None
    }

    /// Stale feed when silence exceeds the gap threshold
    pub fn assess_gap(&self, silence: Duration) -> Option<RiskBreach> {
        if silence > self.gap_threshold {
            return Some(RiskBreach {
                kind: RiskEventKind::FeedStale,
                detail: format!(
                    "feed silent for {}ms, threshold {}ms",
                    silence.as_millis(),
                    self.gap_threshold.as_millis()
                ),
            });
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn guard() -> RiskGuard {
        RiskGuard::new(&RiskConfig::default(), &FeedConfig::default())
    }

    #[test]
    fn test_healthy_account() {
        let account = Account {
            balance: dec!(10000),
            equity: dec!(9800),
            used_margin: dec!(1000),
        };
        assert_eq!(guard().assess_account(&account), None);
        assert_eq!(guard().assess_account(&Account::new(dec!(5))), None);
    }

    #[test]
    fn test_margin_call() {
        let account = Account {
            balance: dec!(1000),
            equity: dec!(400),
            used_margin: dec!(1000),
        };
        let breach = guard().assess_account(&account).unwrap();
        assert_eq!(breach.kind, RiskEventKind::MarginCall);
    }

    #[test]
    fn test_gap_threshold() {
        let g = guard();
        assert_eq!(g.assess_gap(Duration::from_secs(30)), None);
        let breach = g.assess_gap(Duration::from_secs(31)).unwrap();
        assert_eq!(breach.kind, RiskEventKind::FeedStale);
    }
}
