//! Training loop glue between the experience store and the value estimator.

use super::experience_store::{SampledBatch, SharedExperienceStore, Transition};
use super::schedule::beta_at;
use super::value_estimator::{TrainReport, ValueEstimator};
use qtrader_core::ModelError;
use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error};

/// Feeds transitions into the store and runs prioritized optimizer steps
#[derive(Debug)]
pub struct Learner {
    store: SharedExperienceStore,
    estimator: Arc<ValueEstimator>,
    train_steps: AtomicU64,
}

impl Learner {
    pub fn new(store: SharedExperienceStore, estimator: Arc<ValueEstimator>) -> Self {
        Self {
            store,
            estimator,
            train_steps: AtomicU64::new(0),
        }
    }

    pub fn store(&self) -> &SharedExperienceStore {
        &self.store
    }

    pub fn estimator(&self) -> &Arc<ValueEstimator> {
        &self.estimator
    }

    /// Training steps this learner has completed
    pub fn train_steps(&self) -> u64 {
        self.train_steps.load(Ordering::SeqCst)
    }

    pub fn observe(&self, transition: Transition) -> Result<usize, ModelError> {
        Ok(self.store.lock().add(transition)?)
    }

    /// Sample, train and write priorities back
    ///
    /// Returns `None` until the store holds enough transitions. The store lock is held
    /// only while sampling and while writing priorities, so `observe` is never blocked
    /// by the optimizer step. Slots the ring rewrote in between keep their new priority.
    pub fn train_step<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<Option<TrainReport>, ModelError> {
        let (transitions, slots, weights, generations, beta) = {
            let store = self.store.lock();
            if !store.is_ready() {
                return Ok(None);
            }
            let config = store.config();
            let beta = beta_at(self.train_steps(), config.beta_start, config.beta_anneal_steps);
            let SampledBatch {
                transitions,
                slots,
                weights,
                ..
            } = store.sample_batch(config.batch_size, beta, rng)?;
            let generations: Vec<u64> = slots.iter().map(|&slot| store.generation(slot)).collect();
            let transitions: Vec<Transition> = transitions.into_iter().cloned().collect();
            (transitions, slots, weights, generations, beta)
        };

        let batch = SampledBatch {
            transitions: transitions.iter().collect(),
            slots,
            weights,
            beta,
        };
        let report = self.estimator.train_batch(&batch).map_err(|e| {
            error!(error = %e, "Training step failed");
            e
        })?;

        let mut store = self.store.lock();
        let refreshed = store.update_current_priorities(&batch.slots, &generations, &report.td_errors)?;
        let steps = self.train_steps.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(
            steps,
            beta,
            refreshed,
            loss = report.loss,
            total_priority = store.total_priority(),
            "Priorities refreshed"
        );
        Ok(Some(report))
    }
}
