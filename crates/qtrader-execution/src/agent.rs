//! Decision step shared by the backtest and live runners
//!
//! For every tick the agent lets the engine react to the price first (stops, trailing),
//! then encodes the state, picks an action and hands it to the engine. The previous
//! decision on the same symbol becomes a transition whose reward is the equity change
//! since it was taken.

use crate::engine::ExecutionEngine;
use qtrader_core::{
    ActionId, ExchangeGateway, ExecutionObserver, ExplorationConfig, RunnerError, Symbol, Tick,
};
use qtrader_ml::{
    exploration_rate, step_reward, Decision, Learner, Policy, StateEncoder, Tensor, TrainReport,
    Transition, ValueCache,
};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error};

/// Decision awaiting its outcome
#[derive(Debug, Clone)]
struct PendingDecision {
    state: Tensor,
    action: ActionId,
    /// Equity when the decision was taken
    equity: Decimal,
}

pub struct TradingAgent {
    policy: Policy,
    cache: ValueCache,
    encoder: Box<dyn StateEncoder>,
    /// Records transitions when set
    learner: Option<Arc<Learner>>,
    exploration: ExplorationConfig,
    /// Decision steps taken, drives the exploration schedule
    step: u64,
    pending: HashMap<Symbol, PendingDecision>,
    initial_balance: Decimal,
    rng: StdRng,
    observers: Vec<Arc<dyn ExecutionObserver>>,
}

impl TradingAgent {
    pub fn new(
        policy: Policy,
        encoder: Box<dyn StateEncoder>,
        exploration: ExplorationConfig,
        initial_balance: Decimal,
        seed: u64,
    ) -> Self {
        Self {
            policy,
            cache: ValueCache::new(),
            encoder,
            learner: None,
            exploration,
            step: 0,
            pending: HashMap::new(),
            initial_balance,
            rng: StdRng::seed_from_u64(seed),
            observers: Vec::new(),
        }
    }

    pub fn with_learner(mut self, learner: Arc<Learner>) -> Self {
        self.learner = Some(learner);
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn ExecutionObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn learner(&self) -> Option<&Arc<Learner>> {
        self.learner.as_ref()
    }

    pub fn steps(&self) -> u64 {
        self.step
    }

    pub fn exploration_rate(&self) -> f64 {
        exploration_rate(self.step, &self.exploration)
    }

    /// Feed a tick to the encoder and the engine without deciding
    pub async fn warm_up<G: ExchangeGateway>(
        &mut self,
        engine: &ExecutionEngine<G>,
        tick: &Tick,
    ) -> Result<(), RunnerError> {
        engine.on_tick(tick).await?;
        self.encoder.observe(tick);
        Ok(())
    }

    /// React to one tick and take one decision for its symbol
    pub async fn on_tick<G: ExchangeGateway>(
        &mut self,
        engine: &ExecutionEngine<G>,
        tick: &Tick,
    ) -> Result<Decision, RunnerError> {
        engine.on_tick(tick).await?;
        self.encoder.observe(tick);

        let legal = engine.legal_actions(&tick.symbol).await?;
        let position = engine.position(&tick.symbol).await;
        let balance = engine.account().balance;
        let equity = engine.equity().await;
        let state = self
            .encoder
            .encode(&tick.symbol, tick.price, position.as_ref(), balance);

        if let Some(prev) = self.pending.remove(&tick.symbol) {
            self.record(prev, equity, state.clone(), false)?;
        }

        let rate = self.exploration_rate();
        let decision = self.policy.select_action(
            &mut self.cache,
            self.step,
            &state,
            &legal,
            rate,
            &mut self.rng,
        )?;
        // confidence is always finite and within [0.5, 1]
        let confidence = Decimal::from_f64(decision.confidence)
            .unwrap_or(Decimal::ZERO)
            .round_dp(6);

        debug!(
            symbol = %tick.symbol,
            step = self.step,
            action = decision.action_id,
            explored = decision.explored,
            confidence = %confidence,
            "Decision"
        );
        for observer in &self.observers {
            observer.on_decision(&tick.symbol, decision.action_id, decision.explored, rate);
        }

        engine
            .on_action(
                &tick.symbol,
                decision.action_id,
                confidence,
                tick.price,
                tick.timestamp,
            )
            .await?;

        self.pending.insert(
            tick.symbol.clone(),
            PendingDecision {
                state,
                action: decision.action_id,
                equity,
            },
        );
        self.step += 1;
        Ok(decision)
    }

    /// One training step on the agent's own random stream
    pub fn train(&mut self) -> Result<Option<TrainReport>, RunnerError> {
        let Some(learner) = &self.learner else {
            return Ok(None);
        };
        let report = learner.train_step(&mut self.rng).map_err(|e| {
            error!(error = %e, "Training step failed");
            e
        })?;
        if let Some(report) = &report {
            for observer in &self.observers {
                observer.on_train_step(learner.train_steps(), report.loss);
            }
        }
        Ok(report)
    }

    /// Close out pending decisions as terminal transitions
    pub async fn finish<G: ExchangeGateway>(
        &mut self,
        engine: &ExecutionEngine<G>,
    ) -> Result<(), RunnerError> {
        let equity = engine.equity().await;
        let mut pending: Vec<(Symbol, PendingDecision)> = self.pending.drain().collect();
        pending.sort_by(|a, b| a.0.cmp(&b.0));
        for (_, prev) in pending {
            let next_state = prev.state.clone();
            self.record(prev, equity, next_state, true)?;
        }
        Ok(())
    }

    /// Forget history between episodes
    pub fn reset(&mut self, initial_balance: Decimal) {
        self.encoder.reset();
        self.cache.invalidate();
        self.pending.clear();
        self.initial_balance = initial_balance;
    }

    fn record(
        &self,
        prev: PendingDecision,
        equity: Decimal,
        next_state: Tensor,
        done: bool,
    ) -> Result<(), RunnerError> {
        let Some(learner) = &self.learner else {
            return Ok(());
        };
        let reward = step_reward(prev.equity, equity, self.initial_balance);
        learner.observe(Transition::new(
            prev.state,
            prev.action,
            reward,
            next_state,
            done,
        ))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{Duration as ChronoDuration, TimeZone, Utc};
    use parking_lot::Mutex;
    use qtrader_core::{
        Account, AppConfig, EstimatorConfig, GatewayError, GatewayPosition, OrderAck,
        OrderRequest, OrderStatus, ReplayConfig, TradeAction,
    };
    use qtrader_ml::{ExperienceStore, ReturnWindowEncoder, ValueEstimator};
    use rust_decimal_macros::dec;

    /// Fills everything at the requested price of the last tick
    #[derive(Default)]
    struct InstantGateway {
        price: Mutex<Decimal>,
    }

    #[async_trait]
    impl ExchangeGateway for InstantGateway {
        async fn place_order(&self, request: &OrderRequest) -> Result<OrderAck, GatewayError> {
            Ok(OrderAck {
                order_id: request.request_id.clone(),
                request_id: request.request_id.clone(),
                status: OrderStatus::Filled,
                filled_size: request.size,
                avg_price: *self.price.lock(),
                fee: Decimal::ZERO,
            })
        }

        async fn cancel_order(&self, _order_id: &str) -> Result<(), GatewayError> {
            Ok(())
        }

        async fn query_position(&self, _symbol: &str) -> Result<Option<GatewayPosition>, GatewayError> {
            Ok(None)
        }

        async fn query_balance(&self) -> Result<Account, GatewayError> {
            Ok(Account::new(dec!(10000)))
        }

        async fn set_leverage(&self, _symbol: &str, _leverage: Decimal) -> Result<(), GatewayError> {
            Ok(())
        }

        fn name(&self) -> &str {
            "instant"
        }
    }

    fn agent(start: f64) -> TradingAgent {
        agent_with(ExplorationConfig {
            start,
            floor: start.min(0.05),
            decay: 0.99,
        })
    }

    fn agent_with(exploration: ExplorationConfig) -> TradingAgent {
        let encoder = ReturnWindowEncoder::default();
        let estimator = Arc::new(ValueEstimator::new(
            encoder.state_size(),
            4,
            EstimatorConfig {
                hidden_layers: vec![8],
                ..Default::default()
            },
        ));
        let store = ExperienceStore::new(ReplayConfig {
            capacity: 128,
            batch_size: 4,
            min_experiences: 8,
            ..Default::default()
        })
        .unwrap()
        .into_shared();
        TradingAgent::new(
            Policy::new(Arc::clone(&estimator)),
            Box::new(encoder),
            exploration,
            dec!(10000),
            7,
        )
        .with_learner(Arc::new(Learner::new(store, estimator)))
    }

    fn engine() -> ExecutionEngine<Arc<InstantGateway>> {
        engine_with(&AppConfig::default())
    }

    fn engine_with(config: &AppConfig) -> ExecutionEngine<Arc<InstantGateway>> {
        ExecutionEngine::new(
            Arc::new(InstantGateway::default()),
            &["BTCUSDT".to_string()],
            config,
            Account::new(dec!(10000)),
        )
    }

    fn tape(n: usize) -> Vec<Tick> {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        (0..n)
            .map(|i| {
                let price = dec!(100) + Decimal::from((i % 7) as i64) - dec!(3);
                Tick::new("BTCUSDT", price, start + ChronoDuration::seconds(i as i64))
            })
            .collect()
    }

    #[tokio::test]
    async fn test_each_tick_after_the_first_records_a_transition() {
        let engine = engine();
        let mut agent = agent(1.0);
        for tick in tape(10) {
            *engine.gateway().price.lock() = tick.price;
            agent.on_tick(&engine, &tick).await.unwrap();
        }
        assert_eq!(agent.steps(), 10);
        assert_eq!(agent.learner().unwrap().store().lock().len(), 9);

        agent.finish(&engine).await.unwrap();
        assert_eq!(agent.learner().unwrap().store().lock().len(), 10);
    }

    #[tokio::test]
    async fn test_training_starts_once_enough_experience() {
        let engine = engine();
        let mut agent = agent(1.0);
        let ticks = tape(12);
        for (i, tick) in ticks.iter().enumerate() {
            *engine.gateway().price.lock() = tick.price;
            agent.on_tick(&engine, tick).await.unwrap();
            let report = agent.train().unwrap();
            // transitions lag decisions by one tick
            assert_eq!(report.is_some(), i >= 8, "tick {}", i);
        }
        assert_eq!(agent.learner().unwrap().train_steps(), 4);
    }

    #[tokio::test]
    async fn test_exploring_while_flat_never_closes() {
        // no open can pass the gate, so the symbol stays flat throughout
        let mut config = AppConfig::default();
        config.risk.min_confidence = dec!(2);
        let engine = engine_with(&config);
        let mut agent = agent_with(ExplorationConfig {
            start: 1.0,
            floor: 1.0,
            decay: 1.0,
        });

        let mut opens = 0;
        for tick in tape(300) {
            *engine.gateway().price.lock() = tick.price;
            let decision = agent.on_tick(&engine, &tick).await.unwrap();
            assert!(decision.explored);
            assert_ne!(decision.action(), Some(TradeAction::Close));
            if decision.action().and_then(|a| a.opens()).is_some() {
                opens += 1;
            }
        }
        assert!(opens > 150, "opens {}", opens);
        assert!(engine.position("BTCUSDT").await.is_none());
    }

    #[tokio::test]
    async fn test_exploration_decays_with_steps() {
        let engine = engine();
        let mut agent = agent(1.0);
        let first = agent.exploration_rate();
        for tick in tape(20) {
            *engine.gateway().price.lock() = tick.price;
            agent.on_tick(&engine, &tick).await.unwrap();
        }
        assert!(agent.exploration_rate() < first);
    }

    #[tokio::test]
    async fn test_unknown_symbol_is_an_error() {
        let engine = engine();
        let mut agent = agent(0.0);
        let tick = Tick::new("ETHUSDT", dec!(2000), Utc::now());
        let err = agent.on_tick(&engine, &tick).await.unwrap_err();
        assert!(matches!(err, RunnerError::Execution(_)));
    }
}
