//! Application configuration
//!
//! Every section has a `Default` so a partial TOML file is enough to start.

use crate::error::ConfigError;
use crate::types::{Symbol, TradingMode};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub mode: TradingMode,
    pub symbols: Vec<Symbol>,
    pub replay: ReplayConfig,
    pub estimator: EstimatorConfig,
    pub exploration: ExplorationConfig,
    pub risk: RiskConfig,
    pub execution: ExecutionConfig,
    pub feed: FeedConfig,
    pub journal: JournalConfig,
    pub metrics: MetricsConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            mode: TradingMode::Demo,
            symbols: vec!["BTCUSDT".to_string()],
            replay: ReplayConfig::default(),
            estimator: EstimatorConfig::default(),
            exploration: ExplorationConfig::default(),
            risk: RiskConfig::default(),
            execution: ExecutionConfig::default(),
            feed: FeedConfig::default(),
            journal: JournalConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl AppConfig {
    /// Check cross-field constraints
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.symbols.is_empty() {
            return Err(ConfigError::MissingField("symbols".to_string()));
        }
        self.replay.validate()?;
        self.estimator.validate()?;
        self.exploration.validate()?;
        self.risk.validate()?;
        Ok(())
    }
}

fn invalid(field: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        message: message.into(),
    }
}

/// Prioritized replay settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplayConfig {
    /// Maximum number of transitions held
    pub capacity: usize,
    /// Transitions per training batch
    pub batch_size: usize,
    /// Minimum transitions stored before training starts
    pub min_experiences: usize,
    /// Priority exponent, fixed per run
    pub alpha: f64,
    /// Initial importance-sampling exponent
    pub beta_start: f64,
    /// Training steps over which beta reaches 1.0
    pub beta_anneal_steps: u64,
    /// Added to |TD error| so no transition reaches zero priority
    pub priority_epsilon: f64,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            batch_size: 32,
            min_experiences: 256,
            alpha: 0.6,
            beta_start: 0.4,
            beta_anneal_steps: 100_000,
            priority_epsilon: 1e-6,
        }
    }
}

impl ReplayConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.capacity == 0 {
            return Err(invalid("replay.capacity", "must be greater than zero"));
        }
        if self.batch_size == 0 || self.batch_size > self.capacity {
            return Err(invalid("replay.batch_size", "must be in 1..=capacity"));
        }
        if !(0.0..=1.0).contains(&self.alpha) {
            return Err(invalid("replay.alpha", "must be within [0, 1]"));
        }
        if !(0.0..=1.0).contains(&self.beta_start) {
            return Err(invalid("replay.beta_start", "must be within [0, 1]"));
        }
        if self.priority_epsilon <= 0.0 {
            return Err(invalid("replay.priority_epsilon", "must be positive"));
        }
        Ok(())
    }
}

/// How target parameters follow online parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum TargetUpdate {
    /// Copy online to target every `interval` optimizer steps
    Hard { interval: u64 },
    /// Blend `tau` of online into target after every optimizer step
    Soft { tau: f64 },
}

impl Default for TargetUpdate {
    fn default() -> Self {
        TargetUpdate::Hard { interval: 100 }
    }
}

/// Value estimator settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EstimatorConfig {
    /// Sizes of the shared hidden layers
    pub hidden_layers: Vec<usize>,
    pub learning_rate: f64,
    /// Discount factor
    pub gamma: f64,
    /// Huber loss transition point
    pub huber_delta: f64,
    /// Per-element gradient clip
    pub grad_clip: f64,
    pub target_update: TargetUpdate,
    /// Seed for weight initialisation
    pub seed: u64,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            hidden_layers: vec![64, 64],
            learning_rate: 0.001,
            gamma: 0.99,
            huber_delta: 1.0,
            grad_clip: 10.0,
            target_update: TargetUpdate::default(),
            seed: 7,
        }
    }
}

impl EstimatorConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.hidden_layers.iter().any(|&h| h == 0) {
            return Err(invalid("estimator.hidden_layers", "layer sizes must be positive"));
        }
        if !(0.0..=1.0).contains(&self.gamma) {
            return Err(invalid("estimator.gamma", "must be within [0, 1]"));
        }
        if self.learning_rate <= 0.0 {
            return Err(invalid("estimator.learning_rate", "must be positive"));
        }
        match self.target_update {
            TargetUpdate::Hard { interval } if interval == 0 => {
                Err(invalid("estimator.target_update.interval", "must be positive"))
            }
            TargetUpdate::Soft { tau } if !(tau > 0.0 && tau <= 1.0) => {
                Err(invalid("estimator.target_update.tau", "must be within (0, 1]"))
            }
            _ => Ok(()),
        }
    }
}

/// Epsilon-greedy exploration schedule
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExplorationConfig {
    pub start: f64,
    pub floor: f64,
    /// Multiplicative decay applied per step
    pub decay: f64,
}

impl Default for ExplorationConfig {
    fn default() -> Self {
        Self {
            start: 1.0,
            floor: 0.05,
            decay: 0.995,
        }
    }
}

impl ExplorationConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.start) || !(0.0..=1.0).contains(&self.floor) {
            return Err(invalid("exploration", "start and floor must be within [0, 1]"));
        }
        if self.floor > self.start {
            return Err(invalid("exploration.floor", "must not exceed start"));
        }
        if !(self.decay > 0.0 && self.decay <= 1.0) {
            return Err(invalid("exploration.decay", "must be within (0, 1]"));
        }
        Ok(())
    }
}

/// Risk policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    /// Fraction of balance one position may commit as margin
    pub max_position_pct: Decimal,
    pub leverage: Decimal,
    pub min_leverage: Decimal,
    pub max_leverage: Decimal,
    /// Open actions below this confidence are suppressed
    pub min_confidence: Decimal,
    pub stop_loss_pct: Decimal,
    pub take_profit_pct: Decimal,
    pub trailing_stop_pct: Decimal,
    pub enable_stop_loss: bool,
    pub enable_take_profit: bool,
    pub enable_trailing_stop: bool,
    /// Exchange quantity step; sizes are rounded down to it
    pub lot_step: Decimal,
    pub min_order_qty: Decimal,
    /// Equity / used margin below this ratio is a margin call
    pub maintenance_margin_ratio: Decimal,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_position_pct: dec!(0.1),
            leverage: dec!(10),
            min_leverage: dec!(1),
            max_leverage: dec!(25),
            min_confidence: dec!(0.55),
            stop_loss_pct: dec!(0.02),
            take_profit_pct: dec!(0.04),
            trailing_stop_pct: dec!(0.01),
            enable_stop_loss: true,
            enable_take_profit: true,
            enable_trailing_stop: true,
            lot_step: dec!(0.001),
            min_order_qty: dec!(0.001),
            maintenance_margin_ratio: dec!(0.5),
        }
    }
}

impl RiskConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_position_pct <= Decimal::ZERO || self.max_position_pct > Decimal::ONE {
            return Err(invalid("risk.max_position_pct", "must be within (0, 1]"));
        }
        if self.min_leverage <= Decimal::ZERO || self.min_leverage > self.max_leverage {
            return Err(invalid("risk.min_leverage", "must be positive and not exceed max_leverage"));
        }
        if self.lot_step <= Decimal::ZERO {
            return Err(invalid("risk.lot_step", "must be positive"));
        }
        Ok(())
    }
}

/// Gateway call policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Attempt ceiling for transient gateway failures
    pub max_retries: u32,
    pub retry_base_ms: u64,
    pub retry_max_ms: u64,
    /// A call still pending after this is an unknown outcome
    pub call_timeout_ms: u64,
    /// Account polling cadence in live mode
    pub balance_poll_secs: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_base_ms: 1_000,
            retry_max_ms: 8_000,
            call_timeout_ms: 5_000,
            balance_poll_secs: 30,
        }
    }
}

impl ExecutionConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

/// Market feed supervision
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    /// Silence longer than this is a gap; a gap while a position is open is fatal
    pub gap_threshold_secs: u64,
    pub max_reconnect_attempts: u32,
    pub reconnect_base_ms: u64,
    pub reconnect_max_ms: u64,
    /// Ticks of history kept per symbol
    pub buffer_size: usize,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            gap_threshold_secs: 30,
            max_reconnect_attempts: 5,
            reconnect_base_ms: 5_000,
            reconnect_max_ms: 60_000,
            buffer_size: 1_000,
        }
    }
}

impl FeedConfig {
    pub fn gap_threshold(&self) -> Duration {
        Duration::from_secs(self.gap_threshold_secs)
    }
}

/// JSON-lines trade journal
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JournalConfig {
    pub enabled: bool,
    pub path: String,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: "data/trading_journal.jsonl".to_string(),
        }
    }
}

/// Metrics and health HTTP endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub bind_address: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind_address: "127.0.0.1:9090".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        assert!(AppConfig::default().validate().is_ok());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let raw = r#"
            mode = "paper"
            symbols = ["ETHUSDT"]

            [risk]
            leverage = "5"

            [estimator.target_update]
            policy = "soft"
            tau = 0.005
        "#;
        let config: AppConfig = toml::from_str(raw).unwrap();
        assert_eq!(config.mode, TradingMode::Paper);
        assert_eq!(config.symbols, vec!["ETHUSDT".to_string()]);
        assert_eq!(config.risk.leverage, dec!(5));
        assert_eq!(config.risk.stop_loss_pct, dec!(0.02));
        assert_eq!(config.estimator.target_update, TargetUpdate::Soft { tau: 0.005 });
        assert_eq!(config.replay.capacity, 10_000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_leverage_bounds_rejected() {
        let mut config = AppConfig::default();
        config.risk.min_leverage = dec!(30);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_zero_hard_interval_rejected() {
        let mut config = AppConfig::default();
        config.estimator.target_update = TargetUpdate::Hard { interval: 0 };
        assert!(config.validate().is_err());
    }
}
