//! qtrader Core
//!
//! Core types, traits, events and configuration shared by the qtrader crates.

pub mod backoff;
pub mod config;
pub mod episode;
pub mod error;
pub mod events;
pub mod status;
pub mod traits;
pub mod types;

// Re-export commonly used types
pub use backoff::Backoff;
pub use config::*;
pub use episode::{decimal_sqrt, EpisodeMetrics, EpisodeReport, MetricsRecorder};
pub use error::*;
pub use events::*;
pub use status::{RunnerCounters, RunnerStatus};
pub use traits::*;
pub use types::*;
