//! Rolling log-return window encoder

use super::StateEncoder;
use crate::rl::Tensor;
use qtrader_core::{Position, Side, Symbol, Tick};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReturnWindowConfig {
    /// Number of log returns in the state
    pub window: usize,
    /// Log returns are multiplied by this before clipping to [-1, 1]
    pub return_scale: f64,
}

impl Default for ReturnWindowConfig {
    fn default() -> Self {
        Self {
            window: 16,
            return_scale: 100.0,
        }
    }
}

/// State = last `window` scaled log returns (oldest first, zero padded), then the
/// position direction (+1 long, -1 short, 0 flat), then unrealized PnL as a fraction
/// of balance.
#[derive(Debug, Clone)]
pub struct ReturnWindowEncoder {
    config: ReturnWindowConfig,
    prices: HashMap<Symbol, VecDeque<f64>>,
}

impl ReturnWindowEncoder {
    pub fn new(config: ReturnWindowConfig) -> Self {
        Self {
            config,
            prices: HashMap::new(),
        }
    }

    fn returns(&self, symbol: &str) -> Vec<f64> {
        let mut returns = vec![0.0; self.config.window];
        let Some(prices) = self.prices.get(symbol) else {
            return returns;
        };
        let observed: Vec<f64> = prices
            .iter()
            .zip(prices.iter().skip(1))
            .map(|(prev, next)| {
                if *prev > 0.0 && *next > 0.0 {
                    ((next / prev).ln() * self.config.return_scale).clamp(-1.0, 1.0)
                } else {
                    0.0
                }
            })
            .collect();
        let offset = self.config.window - observed.len();
        returns[offset..].copy_from_slice(&observed);
        returns
    }
}

impl Default for ReturnWindowEncoder {
    fn default() -> Self {
        Self::new(ReturnWindowConfig::default())
    }
}

impl StateEncoder for ReturnWindowEncoder {
    fn name(&self) -> &str {
        "return_window"
    }

    fn state_size(&self) -> usize {
        self.config.window + 2
    }

    fn observe(&mut self, tick: &Tick) {
        let Some(price) = tick.price.to_f64() else {
            return;
        };
        let history = self.prices.entry(tick.symbol.clone()).or_default();
        history.push_back(price);
        // window returns need window + 1 prices
        while history.len() > self.config.window + 1 {
            history.pop_front();
        }
    }

    fn encode(&self, symbol: &str, price: Decimal, position: Option<&Position>, balance: Decimal) -> Tensor {
        let mut features = self.returns(symbol);
        let (direction, pnl_fraction) = match position {
            Some(p) => {
                let direction = match p.side {
                    Side::Long => 1.0,
                    Side::Short => -1.0,
                };
                let fraction = if balance > Decimal::ZERO {
                    (p.unrealized_pnl(price) / balance)
                        .to_f64()
                        .unwrap_or(0.0)
                        .clamp(-1.0, 1.0)
                } else {
                    0.0
                };
                (direction, fraction)
            }
            None => (0.0, 0.0),
        };
        features.push(direction);
        features.push(pnl_fraction);
        Tensor::from(features)
    }

    fn reset(&mut self) {
        self.prices.clear();
    }
}
