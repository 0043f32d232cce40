//! qtrader market data
//!
//! Feed supervision (reconnect, gap detection, last-state buffer), connection health
//! and an in-memory tape feed.

pub mod connection_health;
pub mod feed_supervisor;
pub mod tape_feed;

pub use connection_health::{ConnectionHealth, HealthSnapshot, HealthStatus};
pub use feed_supervisor::FeedSupervisor;
pub use tape_feed::TapeFeed;
