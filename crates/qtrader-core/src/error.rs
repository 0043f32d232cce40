use rust_decimal::Decimal;
use thiserror::Error;

/// Priority index errors
///
/// These are invariant violations: the caller passed a value the index can never hold.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum IndexError {
    #[error("Invalid weight {weight} for slot {slot}: weights must be finite and strictly positive")]
    InvalidWeight { slot: usize, weight: f64 },

    #[error("Slot {slot} out of range for capacity {capacity}")]
    SlotOutOfRange { slot: usize, capacity: usize },

    #[error("Index is empty")]
    Empty,

    #[error("Capacity must be greater than zero")]
    ZeroCapacity,
}

/// Experience store errors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error(transparent)]
    Index(#[from] IndexError),

    #[error("Slot {0} holds no transition")]
    EmptySlot(usize),

    #[error("Priority update length mismatch: {slots} slots, {priorities} priorities")]
    LengthMismatch { slots: usize, priorities: usize },

    #[error("Checkpoint does not match store capacity: expected {expected}, got {actual}")]
    CheckpointMismatch { expected: usize, actual: usize },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

/// Value model errors
#[derive(Error, Debug)]
pub enum ModelError {
    #[error("State has {actual} features, model expects {expected}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Action {action} outside vocabulary of {n_actions}")]
    InvalidAction { action: usize, n_actions: usize },

    #[error("Training batch is empty")]
    EmptyBatch,

    #[error("Non-finite value produced during training")]
    NonFinite,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for ModelError {
    fn from(err: serde_json::Error) -> Self {
        ModelError::Serialization(err.to_string())
    }
}

/// Exchange gateway errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GatewayError {
    #[error("Gateway call timed out: {0}")]
    Timeout(String),

    #[error("Rate limited")]
    RateLimited,

    #[error("Network error: {0}")]
    Network(String),

    #[error("Order rejected: {0}")]
    Rejected(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Insufficient balance: {0}")]
    InsufficientBalance(String),
}

impl GatewayError {
    /// Whether retrying the same request could succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            GatewayError::Timeout(_) | GatewayError::RateLimited | GatewayError::Network(_)
        )
    }
}

/// Market feed errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FeedError {
    #[error("Connection failed: {0}")]
    ConnectionError(String),

    #[error("Disconnected")]
    Disconnected,

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Feed exhausted")]
    Exhausted,

    #[error("Reconnect attempts exhausted after {0} tries")]
    ReconnectExhausted(u32),
}

/// Risk management errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RiskError {
    #[error("Risk limit exceeded: {0}")]
    RiskLimitExceeded(String),

    #[error("Confidence {confidence} below threshold {threshold}")]
    ConfidenceBelowThreshold {
        confidence: Decimal,
        threshold: Decimal,
    },

    #[error("Leverage {leverage} outside bounds [{min}, {max}]")]
    LeverageOutOfBounds {
        leverage: Decimal,
        min: Decimal,
        max: Decimal,
    },

    #[error("Fatal risk event on {symbol}: {detail}")]
    FatalRiskEvent { symbol: String, detail: String },

    #[error("Symbol halted: {0}")]
    SymbolHalted(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

/// Execution errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExecutionError {
    #[error("Unknown order outcome for request {request_id}")]
    UnknownOrderOutcome { request_id: String },

    #[error("Retry exhausted after {attempts} attempts: {message}")]
    RetryExhausted { attempts: u32, message: String },

    #[error("Position stuck on {0}: awaiting reconciliation")]
    PositionStuck(String),

    #[error("Unknown symbol: {0}")]
    UnknownSymbol(String),

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error(transparent)]
    Risk(#[from] RiskError),
}

/// Errors that stop a trading session
#[derive(Error, Debug)]
pub enum RunnerError {
    #[error(transparent)]
    Execution(#[from] ExecutionError),

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error(transparent)]
    Feed(#[from] FeedError),
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}")]
    FileNotFound(String),

    #[error("Configuration parse error: {0}")]
    ParseError(String),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("Environment variable not set: {0}")]
    EnvVarNotSet(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_gateway_errors() {
        assert!(GatewayError::Timeout("place_order".into()).is_transient());
        assert!(GatewayError::RateLimited.is_transient());
        assert!(GatewayError::Network("reset".into()).is_transient());
        assert!(!GatewayError::Rejected("qty".into()).is_transient());
        assert!(!GatewayError::InsufficientBalance("margin".into()).is_transient());
    }

    #[test]
    fn test_store_error_wraps_index_error() {
        let err: StoreError = IndexError::Empty.into();
        assert_eq!(err.to_string(), "Index is empty");
    }
}
