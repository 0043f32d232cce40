//! Confidence-scaled position sizing

use qtrader_core::{RiskConfig, RiskError};
use rust_decimal::Decimal;
use tracing::debug;

/// Computes order quantities for open actions
#[derive(Debug, Clone)]
pub struct PositionSizer {
    config: RiskConfig,
}

impl PositionSizer {
    pub fn new(config: RiskConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RiskConfig {
        &self.config
    }

    /// Quantity to open at `price`
    ///
    /// `balance × max_position_pct × confidence × leverage / price`, capped so the
    /// committed margin `size × price / leverage` never exceeds `balance × max_position_pct`,
    /// then rounded down to the lot step.
    pub fn size(
        &self,
        balance: Decimal,
        confidence: Decimal,
        price: Decimal,
        leverage: Decimal,
    ) -> Result<Decimal, RiskError> {
        let cfg = &self.config;

        if confidence < cfg.min_confidence {
            return Err(RiskError::ConfidenceBelowThreshold {
                confidence,
                threshold: cfg.min_confidence,
            });
        }
        if leverage < cfg.min_leverage || leverage > cfg.max_leverage {
            return Err(RiskError::LeverageOutOfBounds {
                leverage,
                min: cfg.min_leverage,
                max: cfg.max_leverage,
            });
        }
        if price <= Decimal::ZERO {
            return Err(RiskError::ValidationError(format!("Invalid price {}", price)));
        }
        if balance <= Decimal::ZERO {
            return Err(RiskError::RiskLimitExceeded(format!(
                "No balance available ({})",
                balance
            )));
        }

        let margin_budget = balance * cfg.max_position_pct;
        let confidence = confidence.clamp(Decimal::ZERO, Decimal::ONE);
        let raw = margin_budget * confidence * leverage / price;
        let cap = margin_budget * leverage / price;
        let size = round_down(raw.min(cap), cfg.lot_step);

        if size < cfg.min_order_qty || size.is_zero() {
            return Err(RiskError::RiskLimitExceeded(format!(
                "Size {} below minimum order quantity {}",
                size, cfg.min_order_qty
            )));
        }

        debug!(
            balance = %balance,
            confidence = %confidence,
            price = %price,
            leverage = %leverage,
            size = %size,
            "Position sized"
        );
        Ok(size)
    }
}

/// Round `value` down to a multiple of `step`
pub fn round_down(value: Decimal, step: Decimal) -> Decimal {
    if step <= Decimal::ZERO {
        return value;
    }
    (value / step).floor() * step
}
