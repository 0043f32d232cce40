//! Deterministic replay of a tick tape through the agent and execution engine

use crate::config::BacktestConfig;
use crate::error::{BacktestError, Result};
use crate::exchange::SimulatedExchange;
use crate::results::{BacktestResults, ReplayCounts};
use qtrader_core::{Account, AppConfig, ExecutionObserver, MetricsRecorder, Symbol, Tick};
use qtrader_execution::{ExecutionEngine, TradingAgent};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Runs backtest episodes over a recorded tape
pub struct BacktestRunner {
    config: BacktestConfig,
    app: AppConfig,
    observers: Vec<Arc<dyn ExecutionObserver>>,
}

impl BacktestRunner {
    pub fn new(config: BacktestConfig, app: AppConfig) -> Self {
        Self {
            config,
            app,
            observers: Vec::new(),
        }
    }

    /// Attach an observer to every episode's engine
    pub fn with_observer(mut self, observer: Arc<dyn ExecutionObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn config(&self) -> &BacktestConfig {
        &self.config
    }

    /// Symbols traded: the configured list, or every symbol on the tape
    pub fn symbols(&self, tape: &[Tick]) -> Vec<Symbol> {
        if !self.config.symbols.is_empty() {
            return self.config.symbols.clone();
        }
        tape.iter()
            .map(|t| t.symbol.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Replay `episodes` passes over the tape, learning across them
    pub async fn run(
        &self,
        tape: &[Tick],
        agent: &mut TradingAgent,
        episodes: usize,
    ) -> Result<Vec<BacktestResults>> {
        let mut results = Vec::with_capacity(episodes);
        for episode in 0..episodes {
            let result = self.run_episode(tape, agent, episode).await?;
            info!(
                episode,
                pnl = %result.report.pnl,
                roi = %result.report.roi,
                trades = result.report.trades,
                train_steps = result.train_steps,
                exploration_rate = agent.exploration_rate(),
                "Episode complete"
            );
            results.push(result);
        }
        Ok(results)
    }

    /// Replay the tape once with a fresh exchange and engine
    pub async fn run_episode(
        &self,
        tape: &[Tick],
        agent: &mut TradingAgent,
        episode: usize,
    ) -> Result<BacktestResults> {
        let symbols = self.symbols(tape);
        let ticks: Vec<&Tick> = tape.iter().filter(|t| symbols.contains(&t.symbol)).collect();
        let Some(last) = ticks.last() else {
            return Err(BacktestError::NoData);
        };
        let end_at = last.timestamp;

        let initial = self.config.initial_capital;
        let exchange = Arc::new(SimulatedExchange::new(
            initial,
            self.config.fees.clone(),
            self.config.slippage.clone(),
        ));
        let recorder = Arc::new(MetricsRecorder::new(initial));
        let mut engine = ExecutionEngine::new(
            Arc::clone(&exchange),
            &symbols,
            &self.app,
            Account::new(initial),
        )
        .with_observer(recorder.clone())
        .with_seed(self.config.seed.wrapping_add(episode as u64));
        for observer in &self.observers {
            engine = engine.with_observer(Arc::clone(observer));
        }

        agent.reset(initial);
        info!(
            episode,
            symbols = ?symbols,
            ticks = ticks.len(),
            initial_capital = %initial,
            "Starting backtest episode"
        );

        let mut counts = ReplayCounts::default();
        let mut seen: HashMap<&str, usize> = HashMap::new();
        for tick in ticks {
            exchange.update_price(&tick.symbol, tick.price).await;
            exchange.set_current_time(tick.timestamp).await;
            counts.ticks += 1;

            let warm = seen.entry(tick.symbol.as_str()).or_insert(0);
            *warm += 1;
            if *warm <= self.config.warmup_ticks {
                agent.warm_up(&engine, tick).await?;
            } else {
                agent.on_tick(&engine, tick).await?;
                counts.decisions += 1;

                let interval = self.config.train_interval;
                if interval > 0 && counts.decisions % interval == 0 {
                    if let Some(report) = agent.train()? {
                        counts.train_steps += 1;
                        debug!(loss = report.loss, "Train step");
                    }
                }
            }

            recorder.record_equity(tick.timestamp, engine.equity().await);
        }

        engine.end_session(end_at).await;
        agent.finish(&engine).await?;
        if let Err(e) = engine.refresh_account(end_at).await {
            warn!(error = %e, "Final account refresh failed");
        }
        recorder.record_equity(end_at, engine.equity().await);

        Ok(BacktestResults::from_metrics(
            episode,
            self.config.seed,
            &recorder.snapshot(),
            counts,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FeeConfig, SlippageConfig};
    use chrono::{Duration, TimeZone, Utc};
    use qtrader_core::{EstimatorConfig, ExplorationConfig, ReplayConfig, TradeAction};
    use qtrader_ml::{
        ExperienceStore, Learner, Policy, ReturnWindowConfig, ReturnWindowEncoder, StateEncoder,
        ValueEstimator,
    };
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn tape() -> Vec<Tick> {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut ticks = Vec::new();
        for i in 0..120i64 {
            let wave = Decimal::from((i % 20 - 10).abs());
            let at = start + Duration::seconds(i);
            ticks.push(Tick::new("BTCUSDT", dec!(40000) + wave * dec!(25), at));
            ticks.push(Tick::new("ETHUSDT", dec!(2000) - wave * dec!(3), at));
        }
        ticks
    }

    fn agent(seed: u64) -> TradingAgent {
        let encoder = ReturnWindowEncoder::new(ReturnWindowConfig {
            window: 8,
            ..Default::default()
        });
        let estimator = Arc::new(ValueEstimator::new(
            encoder.state_size(),
            TradeAction::COUNT,
            EstimatorConfig {
                hidden_layers: vec![16],
                ..Default::default()
            },
        ));
        let store = ExperienceStore::new(ReplayConfig {
            capacity: 512,
            batch_size: 16,
            min_experiences: 32,
            ..Default::default()
        })
        .unwrap()
        .into_shared();
        TradingAgent::new(
            Policy::new(Arc::clone(&estimator)),
            Box::new(encoder),
            ExplorationConfig {
                start: 1.0,
                floor: 0.1,
                decay: 0.99,
            },
            dec!(10000),
            seed,
        )
        .with_learner(Arc::new(Learner::new(store, estimator)))
    }

    fn runner() -> BacktestRunner {
        BacktestRunner::new(
            BacktestConfig {
                initial_capital: dec!(10000),
                fees: FeeConfig::default(),
                slippage: SlippageConfig::default(),
                seed: 11,
                train_interval: 2,
                warmup_ticks: 8,
                symbols: Vec::new(),
            },
            AppConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_episode_trades_and_ends_flat() {
        let runner = runner();
        let mut agent = agent(11);
        let result = runner.run_episode(&tape(), &mut agent, 0).await.unwrap();

        assert_eq!(result.ticks, 240);
        assert_eq!(result.decisions, 240 - 16);
        assert!(result.train_steps > 0);
        assert!(result.report.trades > 0);
        assert_eq!(result.report.trades as usize, result.trades.len());
        assert!(result.trades.iter().all(|t| t.fees > Decimal::ZERO));
        // everything is closed, so equity is the starting capital plus realized pnl
        assert_eq!(
            result.final_equity,
            result.initial_capital + result.report.pnl
        );
        assert_eq!(
            result.symbol_breakdown.keys().cloned().collect::<Vec<_>>(),
            result
                .trades
                .iter()
                .map(|t| t.symbol.clone())
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect::<Vec<_>>()
        );
    }

    #[tokio::test]
    async fn test_default_config_opens_positions() {
        let runner = runner();
        assert_eq!(runner.app.risk.min_confidence, dec!(0.55));
        let mut agent = agent(7);
        let results = runner.run(&tape(), &mut agent, 3).await.unwrap();
        for result in &results {
            assert_eq!(result.decisions, 240 - 16);
            assert!(result.report.trades > 0, "episode {} never traded", result.episode);
        }
    }

    #[tokio::test]
    async fn test_same_seed_same_report() {
        let runner = runner();
        let first = runner.run_episode(&tape(), &mut agent(5), 0).await.unwrap();
        let second = runner.run_episode(&tape(), &mut agent(5), 0).await.unwrap();
        assert_eq!(first.report, second.report);
        assert_eq!(first.trades, second.trades);
    }

    #[tokio::test]
    async fn test_multiple_episodes_keep_learning() {
        let runner = runner();
        let mut agent = agent(3);
        let results = runner.run(&tape(), &mut agent, 2).await.unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[1].episode, 1);
        assert_eq!(agent.steps(), 2 * (240 - 16));
    }

    #[tokio::test]
    async fn test_configured_symbols_restrict_tape() {
        let mut runner = runner();
        runner.config.symbols = vec!["ETHUSDT".to_string()];
        let result = runner.run_episode(&tape(), &mut agent(1), 0).await.unwrap();
        assert_eq!(result.ticks, 120);
        assert!(result.trades.iter().all(|t| t.symbol == "ETHUSDT"));

        runner.config.symbols = vec!["SOLUSDT".to_string()];
        let err = runner.run_episode(&tape(), &mut agent(1), 0).await.unwrap_err();
        assert!(matches!(err, BacktestError::NoData));
    }
}
