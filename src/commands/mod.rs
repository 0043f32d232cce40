//! CLI command implementations

pub mod backtest;
pub mod live;

use anyhow::{Context, Result};
use qtrader_core::{AppConfig, ExecutionObserver, TradeAction};
use qtrader_execution::TradingAgent;
use qtrader_ml::{
    ExperienceStore, Learner, Policy, ReturnWindowEncoder, StateEncoder, ValueEstimator,
};
use rust_decimal::Decimal;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Agent with a learner over a fresh replay store
///
/// Weights come from `load_model` when given, otherwise they are initialised from
/// the estimator seed.
pub fn build_agent(
    app: &AppConfig,
    initial_balance: Decimal,
    seed: u64,
    load_model: Option<&Path>,
    observers: &[Arc<dyn ExecutionObserver>],
) -> Result<(TradingAgent, Arc<ValueEstimator>)> {
    let encoder = ReturnWindowEncoder::default();
    let estimator = match load_model {
        Some(path) => ValueEstimator::load(app.estimator.clone(), path)
            .with_context(|| format!("Failed to load model: {}", path.display()))?,
        None => ValueEstimator::new(
            encoder.state_size(),
            TradeAction::COUNT,
            app.estimator.clone(),
        ),
    };
    if estimator.state_size() != encoder.state_size()
        || estimator.n_actions() != TradeAction::COUNT
    {
        anyhow::bail!(
            "Model expects {} inputs and {} actions, encoder produces {} inputs for {} actions",
            estimator.state_size(),
            estimator.n_actions(),
            encoder.state_size(),
            TradeAction::COUNT
        );
    }
    let estimator = Arc::new(estimator);

    let store = ExperienceStore::new(app.replay.clone())
        .context("Invalid replay configuration")?
        .into_shared();
    let learner = Arc::new(Learner::new(store, Arc::clone(&estimator)));

    let mut agent = TradingAgent::new(
        Policy::new(Arc::clone(&estimator)),
        Box::new(encoder),
        app.exploration.clone(),
        initial_balance,
        seed,
    )
    .with_learner(learner);
    for observer in observers {
        agent = agent.with_observer(Arc::clone(observer));
    }
    Ok((agent, estimator))
}

pub fn save_model(estimator: &ValueEstimator, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
    }
    estimator
        .save(path)
        .with_context(|| format!("Failed to save model: {}", path.display()))?;
    info!(path = %path.display(), "Model saved");
    Ok(())
}
