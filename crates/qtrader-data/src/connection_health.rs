//! Feed connection health and tick inter-arrival tracking

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Maximum number of inter-arrival samples kept for statistics
const MAX_INTERVAL_SAMPLES: usize = 100;

/// Silence after which a connected feed counts as degraded
const DEGRADED_SILENCE: Duration = Duration::from_secs(30);

/// Connection health status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    /// Connected, ticks arriving, no recent failures
    Healthy,
    /// Connected but with recent failures or a silent stream
    Degraded,
    /// Disconnected or failing repeatedly
    Unhealthy,
}

impl HealthStatus {
    /// Numeric value for metrics (0=unhealthy, 1=degraded, 2=healthy)
    pub fn as_metric_value(&self) -> i64 {
        match self {
            HealthStatus::Unhealthy => 0,
            HealthStatus::Degraded => 1,
            HealthStatus::Healthy => 2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
        }
    }
}

/// Tracks feed connection health
///
/// Shared between the feed supervisor (writer) and status reporting (readers).
#[derive(Debug)]
pub struct ConnectionHealth {
    connected: AtomicBool,
    /// Time of last tick, millis since `start_instant`
    last_message_ms: AtomicU64,
    /// Consecutive failure count
    failure_count: AtomicU32,
    reconnects: AtomicU64,
    messages: AtomicU64,
    /// Gaps between consecutive ticks
    intervals: Mutex<VecDeque<Duration>>,
    start_instant: Instant,
}

impl ConnectionHealth {
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(false),
            last_message_ms: AtomicU64::new(0),
            failure_count: AtomicU32::new(0),
            reconnects: AtomicU64::new(0),
            messages: AtomicU64::new(0),
            intervals: Mutex::new(VecDeque::with_capacity(MAX_INTERVAL_SAMPLES)),
            start_instant: Instant::now(),
        }
    }

    fn now_ms(&self) -> u64 {
        self.start_instant.elapsed().as_millis() as u64
    }

    /// Record a received tick
    pub fn record_message(&self) {
        let now = self.now_ms();
        let previous = self.last_message_ms.swap(now, Ordering::AcqRel);
        let count = self.messages.fetch_add(1, Ordering::AcqRel);
        // A successful message resets the failure streak
        self.failure_count.store(0, Ordering::Release);

        if count > 0 {
            let mut samples = self.intervals.lock();
            if samples.len() >= MAX_INTERVAL_SAMPLES {
                samples.pop_front();
            }
            samples.push_back(Duration::from_millis(now.saturating_sub(previous)));
        }
    }

    /// Record a connection or subscription failure
    pub fn record_failure(&self) {
        self.failure_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Record a successful (re)subscription
    pub fn record_connected(&self, is_reconnect: bool) {
        self.connected.store(true, Ordering::Release);
        self.last_message_ms.store(self.now_ms(), Ordering::Release);
        if is_reconnect {
            self.reconnects.fetch_add(1, Ordering::AcqRel);
        }
    }

    pub fn record_disconnected(&self) {
        self.connected.store(false, Ordering::Release);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn time_since_message(&self) -> Duration {
        let last = self.last_message_ms.load(Ordering::Acquire);
        Duration::from_millis(self.now_ms().saturating_sub(last))
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count.load(Ordering::Acquire)
    }

    pub fn reconnects(&self) -> u64 {
        self.reconnects.load(Ordering::Acquire)
    }

    pub fn messages(&self) -> u64 {
        self.messages.load(Ordering::Acquire)
    }

    pub fn status(&self) -> HealthStatus {
        let failures = self.failure_count();

        // More than 3 consecutive failures = unhealthy
        if !self.is_connected() || failures > 3 {
            return HealthStatus::Unhealthy;
        }
        if failures > 0 || self.time_since_message() > DEGRADED_SILENCE {
            return HealthStatus::Degraded;
        }
        HealthStatus::Healthy
    }

    /// Median tick inter-arrival time
    pub fn median_interval(&self) -> Option<Duration> {
        self.percentile(0.5)
    }

    /// P99 tick inter-arrival time
    pub fn p99_interval(&self) -> Option<Duration> {
        self.percentile(0.99)
    }

    fn percentile(&self, q: f64) -> Option<Duration> {
        let samples = self.intervals.lock();
        if samples.is_empty() {
            return None;
        }
        let mut sorted: Vec<Duration> = samples.iter().copied().collect();
        sorted.sort();
        let idx = ((sorted.len() as f64 * q).ceil() as usize).saturating_sub(1);
        Some(sorted[idx.min(sorted.len() - 1)])
    }

    pub fn sample_count(&self) -> usize {
        self.intervals.lock().len()
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        HealthSnapshot {
            status: self.status(),
            connected: self.is_connected(),
            failure_count: self.failure_count(),
            reconnects: self.reconnects(),
            messages: self.messages(),
            time_since_message: self.time_since_message(),
            median_interval: self.median_interval(),
            p99_interval: self.p99_interval(),
        }
    }
}

impl Default for ConnectionHealth {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of connection health
#[derive(Debug, Clone)]
pub struct HealthSnapshot {
    pub status: HealthStatus,
    pub connected: bool,
    pub failure_count: u32,
    pub reconnects: u64,
    pub messages: u64,
    pub time_since_message: Duration,
    pub median_interval: Option<Duration>,
    pub p99_interval: Option<Duration>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state_unhealthy_until_connected() {
        let health = ConnectionHealth::new();
        assert_eq!(health.failure_count(), 0);
        assert_eq!(health.status(), HealthStatus::Unhealthy);

        health.record_connected(false);
        assert_eq!(health.status(), HealthStatus::Healthy);
        assert_eq!(health.reconnects(), 0);
    }

    #[test]
    fn test_failures_degrade_then_fail() {
        let health = ConnectionHealth::new();
        health.record_connected(false);

        health.record_failure();
        assert_eq!(health.status(), HealthStatus::Degraded);

        for _ in 0..3 {
            health.record_failure();
        }
        assert_eq!(health.failure_count(), 4);
        assert_eq!(health.status(), HealthStatus::Unhealthy);
    }

    #[test]
    fn test_message_resets_failures() {
        let health = ConnectionHealth::new();
        health.record_connected(false);
        health.record_failure();
        health.record_failure();
        health.record_message();
        assert_eq!(health.failure_count(), 0);
        assert_eq!(health.messages(), 1);
    }

    #[test]
    fn test_interval_samples_bounded() {
        let health = ConnectionHealth::new();
        for _ in 0..150 {
            health.record_message();
        }
        assert_eq!(health.sample_count(), MAX_INTERVAL_SAMPLES);
        assert!(health.median_interval().is_some());
    }

    #[test]
    fn test_disconnect_and_reconnect() {
        let health = ConnectionHealth::new();
        health.record_connected(false);
        health.record_disconnected();
        assert_eq!(health.status(), HealthStatus::Unhealthy);
        health.record_connected(true);
        assert_eq!(health.reconnects(), 1);
        let snapshot = health.snapshot();
        assert!(snapshot.connected);
        assert_eq!(snapshot.status, HealthStatus::Healthy);
    }

    #[test]
    fn test_health_status_metric_value() {
        assert_eq!(HealthStatus::Healthy.as_metric_value(), 2);
        assert_eq!(HealthStatus::Degraded.as_metric_value(), 1);
        assert_eq!(HealthStatus::Unhealthy.as_metric_value(), 0);
    }
}
