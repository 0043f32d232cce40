//! qtrader Observability
//!
//! Logging, prometheus metrics, the metrics/health server and the trade journal.

pub mod health;
pub mod journal;
pub mod logging;
pub mod metrics;

pub use health::{create_router, HealthServer, StatusHandle};
pub use journal::{JournalEventType, TradeJournal};
pub use logging::{init_logging, LogFormat, LoggingError};
pub use metrics::{gather_metrics, register_metrics, PrometheusObserver};
