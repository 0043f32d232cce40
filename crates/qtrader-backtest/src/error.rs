//! Backtest error types

use qtrader_core::{ExecutionError, ModelError, RunnerError};
use thiserror::Error;

/// Backtest result type alias
pub type Result<T> = std::result::Result<T, BacktestError>;

/// Backtest errors
#[derive(Error, Debug)]
pub enum BacktestError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("No ticks on the tape")]
    NoData,

    #[error("Tape line {line}: {message}")]
    ParseError { line: usize, message: String },

    #[error(transparent)]
    Execution(#[from] ExecutionError),

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl From<RunnerError> for BacktestError {
    fn from(err: RunnerError) -> Self {
        match err {
            RunnerError::Execution(e) => BacktestError::Execution(e),
            RunnerError::Model(e) => BacktestError::Model(e),
            // a backtest reads its tape up front and has no live feed
            RunnerError::Feed(e) => BacktestError::ConfigError(e.to_string()),
        }
    }
}

impl From<serde_json::Error> for BacktestError {
    fn from(err: serde_json::Error) -> Self {
        BacktestError::SerializationError(err.to_string())
    }
}
