//! Market feed supervision
//!
//! [`FeedSupervisor`] wraps a [`MarketFeed`] and turns its failure modes into a clean
//! event stream: disconnects are retried with jittered exponential backoff, silence
//! beyond the gap threshold is reported as a [`FeedGap`], and ticks are only ever the
//! ones the feed delivered. Nothing is replayed or interpolated across an outage.

use crate::connection_health::ConnectionHealth;
use chrono::{DateTime, Utc};
use qtrader_core::{Backoff, FeedConfig, FeedError, FeedEvent, FeedGap, MarketFeed, Symbol, Tick};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{debug, error, info, warn};

/// Slack added to the gap deadline so a reported gap is strictly beyond the threshold
const GAP_SLACK: Duration = Duration::from_millis(1);

pub struct FeedSupervisor<F> {
    feed: F,
    symbols: Vec<Symbol>,
    config: FeedConfig,
    backoff: Backoff,
    rng: StdRng,
    health: Arc<ConnectionHealth>,
    connected: bool,
    ever_connected: bool,
    /// Consecutive failed connection attempts
    failures: u32,
    retry_at: Option<Instant>,
    history: HashMap<Symbol, VecDeque<Tick>>,
    last_tick_at: Option<DateTime<Utc>>,
    /// Start of the current silence
    last_activity: Instant,
    gap_reported: bool,
}

impl<F: MarketFeed> FeedSupervisor<F> {
    pub fn new(feed: F, symbols: Vec<Symbol>, config: FeedConfig, seed: u64) -> Self {
        let backoff = Backoff::from_millis(config.reconnect_base_ms, config.reconnect_max_ms);
        Self {
            feed,
            symbols,
            config,
            backoff,
            rng: StdRng::seed_from_u64(seed),
            health: Arc::new(ConnectionHealth::new()),
            connected: false,
            ever_connected: false,
            failures: 0,
            retry_at: None,
            history: HashMap::new(),
            last_tick_at: None,
            last_activity: Instant::now(),
            gap_reported: false,
        }
    }

    pub fn health(&self) -> Arc<ConnectionHealth> {
        Arc::clone(&self.health)
    }

    pub fn feed_name(&self) -> &str {
        self.feed.name()
    }

    pub fn symbols(&self) -> &[Symbol] {
        &self.symbols
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Last tick received for `symbol`
    pub fn last_tick(&self, symbol: &str) -> Option<&Tick> {
        self.history.get(symbol).and_then(|h| h.back())
    }

    /// Buffered ticks for `symbol`, oldest first
    pub fn recent_ticks(&self, symbol: &str) -> impl Iterator<Item = &Tick> {
        self.history.get(symbol).into_iter().flatten()
    }

    /// Next tick or gap
    ///
    /// Returns `Err(Exhausted)` when the underlying feed ends and
    /// `Err(ReconnectExhausted)` after too many consecutive failed connection attempts.
    pub async fn next_event(&mut self) -> Result<FeedEvent, FeedError> {
        loop {
            if let Some(gap) = self.check_silence() {
                return Ok(FeedEvent::Gap(gap));
            }

            if !self.connected {
                if let Some(retry_at) = self.retry_at {
                    let wake = match self.gap_deadline() {
                        Some(deadline) => retry_at.min(deadline),
                        None => retry_at,
                    };
                    if Instant::now() < wake {
                        sleep_until(wake).await;
                        continue;
                    }
                }
                self.retry_at = None;
                self.try_connect().await?;
                continue;
            }

            let next = match self.gap_deadline() {
                Some(deadline) => {
                    let wait = deadline.saturating_duration_since(Instant::now());
                    match timeout(wait, self.feed.next_event()).await {
                        Ok(result) => result,
                        // silence check at the top of the loop reports it
                        Err(_) => continue,
                    }
                }
                None => self.feed.next_event().await,
            };

            match next {
                Ok(FeedEvent::Tick(tick)) => {
                    self.record_tick(&tick);
                    return Ok(FeedEvent::Tick(tick));
                }
                Ok(FeedEvent::Gap(gap)) => {
                    warn!(
                        feed = self.feed.name(),
                        symbol = ?gap.symbol,
                        silence_ms = gap.silence_ms,
                        "Feed reported a gap"
                    );
                    return Ok(FeedEvent::Gap(gap));
                }
                Err(FeedError::ParseError(message)) => {
                    warn!(feed = self.feed.name(), error = %message, "Skipping unparseable message");
                }
                Err(FeedError::Disconnected) => {
                    self.mark_disconnected("disconnected");
                }
                Err(FeedError::ConnectionError(message)) => {
                    self.mark_disconnected(&message);
                }
                Err(e @ FeedError::Exhausted) => {
                    info!(feed = self.feed.name(), "Feed exhausted");
                    self.connected = false;
                    self.health.record_disconnected();
                    return Err(e);
                }
                Err(e @ FeedError::ReconnectExhausted(_)) => return Err(e),
            }
        }
    }

    async fn try_connect(&mut self) -> Result<(), FeedError> {
        match self.feed.connect(&self.symbols).await {
            Ok(()) => {
                let is_reconnect = self.ever_connected;
                self.connected = true;
                self.ever_connected = true;
                self.failures = 0;
                if self.last_tick_at.is_none() {
                    self.last_activity = Instant::now();
                }
                self.health.record_connected(is_reconnect);
                info!(
                    feed = self.feed.name(),
                    symbols = ?self.symbols,
                    reconnect = is_reconnect,
                    "Feed subscribed"
                );
                Ok(())
            }
            Err(e) => {
                self.failures += 1;
                self.health.record_failure();
                if self.failures >= self.config.max_reconnect_attempts {
                    error!(
                        feed = self.feed.name(),
                        attempts = self.failures,
                        error = %e,
                        "Feed reconnect attempts exhausted"
                    );
                    return Err(FeedError::ReconnectExhausted(self.failures));
                }
                self.schedule_retry(&e.to_string());
                Ok(())
            }
        }
    }

    fn mark_disconnected(&mut self, reason: &str) {
        self.connected = false;
        self.health.record_disconnected();
        self.health.record_failure();
        self.schedule_retry(reason);
    }

    fn schedule_retry(&mut self, reason: &str) {
        let delay = self.backoff.next_delay(&mut self.rng);
        self.retry_at = Some(Instant::now() + delay);
        warn!(
            feed = self.feed.name(),
            reason = %reason,
            attempt = self.backoff.attempts(),
            delay_ms = delay.as_millis() as u64,
            "Feed connection lost, resubscribing after backoff"
        );
    }

    fn record_tick(&mut self, tick: &Tick) {
        self.last_activity = Instant::now();
        self.last_tick_at = Some(tick.timestamp);
        if self.gap_reported {
            info!(feed = self.feed.name(), symbol = %tick.symbol, "Feed resumed after gap");
        }
        self.gap_reported = false;
        self.health.record_message();
        if self.backoff.attempts() > 0 {
            debug!(feed = self.feed.name(), "Backoff reset after successful resubscription");
            self.backoff.reset();
        }

        let history = self.history.entry(tick.symbol.clone()).or_default();
        history.push_back(tick.clone());
        while history.len() > self.config.buffer_size.max(1) {
            history.pop_front();
        }
    }

    fn gap_deadline(&self) -> Option<Instant> {
        if self.gap_reported {
            None
        } else {
            Some(self.last_activity + self.config.gap_threshold() + GAP_SLACK)
        }
    }

    fn check_silence(&mut self) -> Option<FeedGap> {
        if self.gap_reported {
            return None;
        }
        let silence = self.last_activity.elapsed();
        if silence <= self.config.gap_threshold() {
            return None;
        }
        self.gap_reported = true;
        let gap = FeedGap {
            symbol: None,
            last_tick_at: self.last_tick_at,
            detected_at: Utc::now(),
            silence_ms: silence.as_millis() as u64,
        };
        warn!(
            feed = self.feed.name(),
            silence_ms = gap.silence_ms,
            connected = self.connected,
            "Feed gap detected"
        );
        Some(gap)
    }
}
