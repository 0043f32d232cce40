//! In-memory market feed over a recorded tick tape

use async_trait::async_trait;
use qtrader_core::{FeedError, FeedEvent, MarketFeed, Symbol, Tick};
use std::collections::{HashSet, VecDeque};
use std::time::Duration;
use tokio::time::{sleep_until, Instant};

/// Replays ticks in order, optionally paced, then reports `Exhausted`
///
/// `next_event` is cancel safe: a tick is only taken off the tape once its pacing
/// delay has elapsed.
#[derive(Debug, Clone)]
pub struct TapeFeed {
    ticks: VecDeque<Tick>,
    symbols: HashSet<Symbol>,
    pace: Option<Duration>,
    /// Delivery time of the next paced tick
    next_due: Option<Instant>,
    connected: bool,
}

impl TapeFeed {
    pub fn new(ticks: Vec<Tick>) -> Self {
        Self {
            ticks: ticks.into(),
            symbols: HashSet::new(),
            pace: None,
            next_due: None,
            connected: false,
        }
    }

    /// Wait `pace` before delivering each tick
    pub fn with_pace(mut self, pace: Duration) -> Self {
        self.pace = Some(pace);
        self
    }

    pub fn remaining(&self) -> usize {
        self.ticks.len()
    }
}

#[async_trait]
impl MarketFeed for TapeFeed {
    async fn connect(&mut self, symbols: &[Symbol]) -> Result<(), FeedError> {
        self.symbols = symbols.iter().cloned().collect();
        self.connected = true;
        Ok(())
    }

    async fn next_event(&mut self) -> Result<FeedEvent, FeedError> {
        if !self.connected {
            return Err(FeedError::Disconnected);
        }
        if let Some(pace) = self.pace {
            let due = *self.next_due.get_or_insert_with(|| Instant::now() + pace);
            sleep_until(due).await;
            self.next_due = None;
        }
        loop {
            let tick = self.ticks.pop_front().ok_or(FeedError::Exhausted)?;
            if !self.symbols.is_empty() && !self.symbols.contains(&tick.symbol) {
                continue;
            }
            return Ok(FeedEvent::Tick(tick));
        }
    }

    fn name(&self) -> &str {
        "tape"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn ticks() -> Vec<Tick> {
        vec![
            Tick::new("BTCUSDT", dec!(100), Utc::now()),
            Tick::new("ETHUSDT", dec!(10), Utc::now()),
            Tick::new("BTCUSDT", dec!(101), Utc::now()),
        ]
    }

    #[tokio::test]
    async fn test_requires_connect() {
        let mut feed = TapeFeed::new(ticks());
        assert_eq!(feed.next_event().await, Err(FeedError::Disconnected));
    }

    #[tokio::test]
    async fn test_filters_to_subscribed_symbols() {
        let mut feed = TapeFeed::new(ticks());
        feed.connect(&["BTCUSDT".to_string()]).await.unwrap();
        let mut prices = Vec::new();
        while let Ok(FeedEvent::Tick(t)) = feed.next_event().await {
            prices.push(t.price);
        }
        assert_eq!(prices, vec![dec!(100), dec!(101)]);
        assert_eq!(feed.next_event().await, Err(FeedError::Exhausted));
    }

    #[tokio::test(start_paused = true)]
    async fn test_paced_tick_survives_cancellation() {
        let mut feed = TapeFeed::new(ticks()).with_pace(Duration::from_secs(10));
        feed.connect(&[]).await.unwrap();

        let early = tokio::time::timeout(Duration::from_secs(4), feed.next_event()).await;
        assert!(early.is_err());
        assert_eq!(feed.remaining(), 3);

        let start = Instant::now();
        let event = feed.next_event().await.unwrap();
        assert_eq!(start.elapsed(), Duration::from_secs(6));
        assert!(matches!(event, FeedEvent::Tick(t) if t.price == dec!(100)));
    }

    #[tokio::test]
    async fn test_empty_subscription_passes_everything() {
        let mut feed = TapeFeed::new(ticks());
        feed.connect(&[]).await.unwrap();
        let mut count = 0;
        while feed.next_event().await.is_ok() {
            count += 1;
        }
        assert_eq!(count, 3);
        assert_eq!(feed.remaining(), 0);
    }
}
