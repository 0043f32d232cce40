//! Live trading loop
//!
//! Pulls events from a [`FeedSupervisor`], lets the [`TradingAgent`] decide on every
//! tick, forwards gaps to the engine and polls the account on a fixed cadence. A
//! `watch` channel stops the loop; every open position is closed before `run` returns.

use crate::agent::TradingAgent;
use crate::engine::ExecutionEngine;
use crate::state_machine::SymbolStatus;
use chrono::Utc;
use parking_lot::RwLock;
use qtrader_core::{
    ExchangeGateway, ExecutionObserver, FeedError, FeedEvent, MarketFeed, RunnerError,
    RunnerStatus, TradingMode,
};
use qtrader_data::FeedSupervisor;
use qtrader_ml::Learner;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

pub type SharedStatus = Arc<RwLock<RunnerStatus>>;

/// Background training cadence
#[derive(Debug, Clone)]
pub struct TrainingSchedule {
    pub interval: Duration,
    pub seed: u64,
}

pub struct LiveRunner<G, F: MarketFeed> {
    engine: ExecutionEngine<G>,
    feed: FeedSupervisor<F>,
    agent: TradingAgent,
    balance_poll: Duration,
    training: Option<TrainingSchedule>,
    status: SharedStatus,
    observers: Vec<Arc<dyn ExecutionObserver>>,
}

impl<G, F> LiveRunner<G, F>
where
    G: ExchangeGateway,
    F: MarketFeed,
{
    pub fn new(
        engine: ExecutionEngine<G>,
        feed: FeedSupervisor<F>,
        agent: TradingAgent,
        mode: TradingMode,
        balance_poll: Duration,
    ) -> Self {
        let symbols = engine.symbols().cloned().collect();
        Self {
            engine,
            feed,
            agent,
            balance_poll,
            training: None,
            status: Arc::new(RwLock::new(RunnerStatus::new(mode, symbols))),
            observers: Vec::new(),
        }
    }

    /// Train the agent's learner concurrently with trading
    pub fn with_training(mut self, schedule: TrainingSchedule) -> Self {
        self.training = Some(schedule);
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn ExecutionObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    /// Handle for the health endpoint
    pub fn status_handle(&self) -> SharedStatus {
        Arc::clone(&self.status)
    }

    pub fn status(&self) -> RunnerStatus {
        self.status.read().clone()
    }

    pub fn engine(&self) -> &ExecutionEngine<G> {
        &self.engine
    }

    /// Trade until the feed ends, fails or `shutdown` flips to true
    ///
    /// Returns the symbol statuses after the closing sweep. A dead feed is reported as
    /// an error once positions have been closed.
    pub async fn run(
        mut self,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<Vec<SymbolStatus>, RunnerError> {
        {
            let mut status = self.status.write();
            status.running = true;
            status.started_at = Some(Utc::now());
        }
        info!(
            feed = self.feed.feed_name(),
            symbols = ?self.feed.symbols(),
            "Live runner started"
        );

        let (stop_training, training_task) = self.spawn_training();

        let mut poll = interval(self.balance_poll);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick completes immediately
        poll.tick().await;

        let mut failure = None;
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Shutdown requested");
                        break;
                    }
                }
                _ = poll.tick() => {
                    if let Err(e) = self.engine.refresh_account(Utc::now()).await {
                        warn!(error = %e, "Account poll failed");
                    }
                    publish_status(&self.engine, &self.status, &self.observers, self.progress()).await;
                }
                event = self.feed.next_event() => match event {
                    Ok(FeedEvent::Tick(tick)) => {
                        if let Err(e) = self.agent.on_tick(&self.engine, &tick).await {
                            match e {
                                RunnerError::Model(_) => {
                                    error!(symbol = %tick.symbol, error = %e, "Decision failed");
                                    failure = Some(e);
                                    break;
                                }
                                _ => warn!(symbol = %tick.symbol, error = %e, "Tick not handled"),
                            }
                        }
                        self.status.write().metrics.ticks += 1;
                        publish_status(&self.engine, &self.status, &self.observers, self.progress()).await;
                    }
                    Ok(FeedEvent::Gap(gap)) => {
                        warn!(
                            symbol = ?gap.symbol,
                            silence_ms = gap.silence_ms,
                            "Feed gap"
                        );
                        self.engine.on_feed_gap(&gap).await;
                        self.status.write().metrics.feed_gaps += 1;
                        publish_status(&self.engine, &self.status, &self.observers, self.progress()).await;
                    }
                    Err(FeedError::Exhausted) => {
                        info!(feed = self.feed.feed_name(), "Feed ended");
                        break;
                    }
                    Err(e) => {
                        error!(feed = self.feed.feed_name(), error = %e, "Feed failed");
                        failure = Some(RunnerError::Feed(e));
                        break;
                    }
                },
            }
        }

        let _ = stop_training.send(true);
        if let Some(task) = training_task {
            if let Err(e) = task.await {
                warn!(error = %e, "Training task ended abnormally");
            }
        }

        let statuses = self.engine.end_session(Utc::now()).await;
        if let Err(e) = self.agent.finish(&self.engine).await {
            warn!(error = %e, "Could not record final transitions");
        }
        publish_status(&self.engine, &self.status, &self.observers, self.progress()).await;
        self.status.write().running = false;

        let stuck: Vec<_> = statuses.iter().filter(|s| s.state == "stuck").collect();
        if !stuck.is_empty() {
            error!(count = stuck.len(), "Symbols left stuck at shutdown");
        }
        info!(
            ticks = self.status.read().metrics.ticks,
            decisions = self.agent.steps(),
            "Live runner stopped"
        );

        match failure {
            Some(e) => Err(e),
            None => Ok(statuses),
        }
    }

    fn spawn_training(&self) -> (watch::Sender<bool>, Option<JoinHandle<()>>) {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let (Some(schedule), Some(learner)) = (self.training.clone(), self.agent.learner().cloned())
        else {
            return (stop_tx, None);
        };
        let observers = self.observers.clone();

        let task = tokio::spawn(async move {
            let mut rng = StdRng::seed_from_u64(schedule.seed);
            let mut ticker = interval(schedule.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = stop_rx.changed() => break,
                    _ = ticker.tick() => {
                        // optimizer steps are CPU-bound; keep them off the runtime workers
                        let learner = Arc::clone(&learner);
                        let observers = observers.clone();
                        let step = tokio::task::spawn_blocking(move || {
                            train_once(&learner, &mut rng, &observers);
                            rng
                        });
                        match step.await {
                            Ok(returned) => rng = returned,
                            Err(e) => {
                                error!(error = %e, "Training task panicked");
                                break;
                            }
                        }
                    }
                }
            }
            debug!(steps = learner.train_steps(), "Training task stopped");
        });
        (stop_tx, Some(task))
    }

    fn progress(&self) -> Progress {
        let health = self.feed.health();
        Progress {
            connected: self.feed.is_connected(),
            reconnects: health.reconnects(),
            decisions: self.agent.steps(),
            exploration_rate: self.agent.exploration_rate(),
            train_steps: self.agent.learner().map(|l| l.train_steps()),
        }
    }
}

/// Counters read synchronously before publishing
struct Progress {
    connected: bool,
    reconnects: u64,
    decisions: u64,
    exploration_rate: f64,
    train_steps: Option<u64>,
}

async fn publish_status<G: ExchangeGateway>(
    engine: &ExecutionEngine<G>,
    status: &SharedStatus,
    observers: &[Arc<dyn ExecutionObserver>],
    progress: Progress,
) {
    let halted = engine.halted_symbols().await;
    let equity = engine.equity().await;

    {
        let mut status = status.write();
        status.feed_connected = progress.connected;
        status.halted_symbols = halted;
        status.metrics.decisions = progress.decisions;
        status.metrics.exploration_rate = progress.exploration_rate;
        status.metrics.equity = equity;
        if let Some(steps) = progress.train_steps {
            status.metrics.train_steps = steps;
        }
    }

    for observer in observers {
        observer.on_feed_status(progress.connected, progress.reconnects);
    }
}

fn train_once(learner: &Learner, rng: &mut StdRng, observers: &[Arc<dyn ExecutionObserver>]) {
    match learner.train_step(rng) {
        Ok(Some(report)) => {
            let steps = learner.train_steps();
            debug!(steps, loss = report.loss, "Training step");
            for observer in observers {
                observer.on_train_step(steps, report.loss);
            }
        }
        Ok(None) => {}
        Err(e) => error!(error = %e, "Training step failed"),
    }
}
