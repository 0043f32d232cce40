//! Dueling double-Q value estimator.
//!
//! Online and target parameters are immutable `Arc` snapshots. Training clones the
//! online snapshot, applies one optimizer step to the private copy and publishes it with
//! a single write, so inference never observes a half-updated parameter set and the
//! target snapshot is never the object being modified.

use super::experience_store::{SampledBatch, Tensor};
use super::network::DuelingParams;
use ndarray::Array1;
use parking_lot::{Mutex, RwLock};
use qtrader_core::{EstimatorConfig, ModelError, TargetUpdate};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Outcome of one optimizer step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainReport {
    /// Importance-weighted Huber loss, averaged over the batch
    pub loss: f64,
    /// `y - Q(s, a)` per transition, in batch order
    pub td_errors: Vec<f64>,
    pub mean_q: f64,
    /// Optimizer step count after this step
    pub step: u64,
    pub target_synced: bool,
}

/// Persisted estimator parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EstimatorSnapshot {
    pub online: DuelingParams,
    pub target: DuelingParams,
    pub steps: u64,
}

pub struct ValueEstimator {
    config: EstimatorConfig,
    state_size: usize,
    n_actions: usize,
    online: RwLock<Arc<DuelingParams>>,
    target: RwLock<Arc<DuelingParams>>,
    steps: AtomicU64,
    /// Serializes optimizer steps; inference never takes it
    train_lock: Mutex<()>,
}

impl ValueEstimator {
    pub fn new(state_size: usize, n_actions: usize, config: EstimatorConfig) -> Self {
        let mut rng = StdRng::seed_from_u64(config.seed);
        let params = Arc::new(DuelingParams::new(
            state_size,
            &config.hidden_layers,
            n_actions,
            &mut rng,
        ));
        info!(
            state_size,
            n_actions,
            hidden = ?config.hidden_layers,
            target_update = ?config.target_update,
            "Value estimator initialized"
        );
        Self::from_parts(config, Arc::clone(&params), params, 0)
    }

    fn from_parts(
        config: EstimatorConfig,
        online: Arc<DuelingParams>,
        target: Arc<DuelingParams>,
        steps: u64,
    ) -> Self {
        Self {
            state_size: online.input_size(),
            n_actions: online.n_actions(),
            config,
            online: RwLock::new(online),
            target: RwLock::new(target),
            steps: AtomicU64::new(steps),
            train_lock: Mutex::new(()),
        }
    }

    pub fn state_size(&self) -> usize {
        self.state_size
    }

    pub fn n_actions(&self) -> usize {
        self.n_actions
    }

    pub fn config(&self) -> &EstimatorConfig {
        &self.config
    }

    /// Optimizer steps taken so far
    pub fn steps(&self) -> u64 {
        self.steps.load(Ordering::SeqCst)
    }

    pub fn online_snapshot(&self) -> Arc<DuelingParams> {
        self.online.read().clone()
    }

    pub fn target_snapshot(&self) -> Arc<DuelingParams> {
        self.target.read().clone()
    }

    /// `Q(state, ·)` from the current online snapshot
    pub fn q_values(&self, state: &Tensor) -> Result<Array1<f64>, ModelError> {
        self.check_state(state)?;
        Ok(self.online_snapshot().q_values(state))
    }

    /// Double-Q bootstrap target from the current snapshots
    pub fn bootstrap_target(
        &self,
        reward: f64,
        next_state: &Tensor,
        done: bool,
    ) -> Result<f64, ModelError> {
        self.check_state(next_state)?;
        Ok(double_q_target(
            &self.online_snapshot(),
            &self.target_snapshot(),
            reward,
            next_state,
            done,
            self.config.gamma,
        ))
    }

    /// One optimizer step over a sampled batch
    pub fn train_batch(&self, batch: &SampledBatch<'_>) -> Result<TrainReport, ModelError> {
        if batch.is_empty() {
            return Err(ModelError::EmptyBatch);
        }
        let _guard = self.train_lock.lock();

        let online = self.online_snapshot();
        let target = self.target_snapshot();
        let delta = self.config.huber_delta;

        let mut grads = online.zeros_like();
        let mut td_errors = Vec::with_capacity(batch.len());
        let mut loss = 0.0;
        let mut q_sum = 0.0;

        for (transition, &weight) in batch.transitions.iter().zip(&batch.weights) {
            self.check_state(&transition.state)?;
            self.check_state(&transition.next_state)?;
            if transition.action >= self.n_actions {
                return Err(ModelError::InvalidAction {
                    action: transition.action,
                    n_actions: self.n_actions,
                });
            }

            let y = double_q_target(
                &online,
                &target,
                transition.reward,
                &transition.next_state,
                transition.done,
                self.config.gamma,
            );
            let pass = online.forward_pass(&transition.state);
            let q = pass.q_values()[transition.action];
            let td = y - q;

            loss += weight * huber(td, delta);
            q_sum += q;
            // dL/dQ = -w * huber'(y - Q)
            online.backward(&pass, transition.action, -weight * huber_grad(td, delta), &mut grads);
            td_errors.push(td);
        }

        let n = batch.len() as f64;
        let mut updated = (*online).clone();
        updated.apply_gradients(
            &grads,
            1.0 / n,
            self.config.learning_rate,
            self.config.grad_clip,
        );
        if !loss.is_finite() || !updated.is_finite() {
            return Err(ModelError::NonFinite);
        }

        let updated = Arc::new(updated);
        *self.online.write() = Arc::clone(&updated);
        let step = self.steps.fetch_add(1, Ordering::SeqCst) + 1;
        let target_synced = self.update_target(&updated, step);

        let report = TrainReport {
            loss: loss / n,
            td_errors,
            mean_q: q_sum / n,
            step,
            target_synced,
        };
        debug!(
            step,
            loss = report.loss,
            mean_q = report.mean_q,
            beta = batch.beta,
            target_synced,
            "Optimizer step"
        );
        Ok(report)
    }

    fn update_target(&self, online: &Arc<DuelingParams>, step: u64) -> bool {
        match self.config.target_update {
            TargetUpdate::Hard { interval } => {
                if interval > 0 && step % interval == 0 {
                    *self.target.write() = Arc::clone(online);
                    true
                } else {
                    false
                }
            }
            TargetUpdate::Soft { tau } => {
                let mut blended = (*self.target_snapshot()).clone();
                blended.blend(online, tau);
                *self.target.write() = Arc::new(blended);
                true
            }
        }
    }

    fn check_state(&self, state: &Tensor) -> Result<(), ModelError> {
        if state.len() != self.state_size {
            return Err(ModelError::DimensionMismatch {
                expected: self.state_size,
                actual: state.len(),
            });
        }
        Ok(())
    }

    pub fn snapshot(&self) -> EstimatorSnapshot {
        let _guard = self.train_lock.lock();
        EstimatorSnapshot {
            online: (*self.online_snapshot()).clone(),
            target: (*self.target_snapshot()).clone(),
            steps: self.steps(),
        }
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ModelError> {
        let path = path.as_ref();
        let json = serde_json::to_string(&self.snapshot())?;
        std::fs::write(path, json)?;
        info!(path = %path.display(), steps = self.steps(), "Saved value estimator");
        Ok(())
    }

    pub fn load(config: EstimatorConfig, path: impl AsRef<Path>) -> Result<Self, ModelError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)?;
        let snapshot: EstimatorSnapshot = serde_json::from_str(&json)?;
        let estimator = Self::restore(config, snapshot)?;
        info!(path = %path.display(), steps = estimator.steps(), "Loaded value estimator");
        Ok(estimator)
    }

    pub fn restore(config: EstimatorConfig, snapshot: EstimatorSnapshot) -> Result<Self, ModelError> {
        let (online, target) = (snapshot.online, snapshot.target);
        if online.input_size() != target.input_size() {
            return Err(ModelError::DimensionMismatch {
                expected: online.input_size(),
                actual: target.input_size(),
            });
        }
        if online.n_actions() != target.n_actions() {
            return Err(ModelError::InvalidAction {
                action: target.n_actions(),
                n_actions: online.n_actions(),
            });
        }
        Ok(Self::from_parts(
            config,
            Arc::new(online),
            Arc::new(target),
            snapshot.steps,
        ))
    }
}

impl std::fmt::Debug for ValueEstimator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValueEstimator")
            .field("state_size", &self.state_size)
            .field("n_actions", &self.n_actions)
            .field("steps", &self.steps())
            .finish()
    }
}

/// `y = r + γ · (1 − done) · Q_target(s', argmax_a Q_online(s', a))`
fn double_q_target(
    online: &DuelingParams,
    target: &DuelingParams,
    reward: f64,
    next_state: &Tensor,
    done: bool,
    gamma: f64,
) -> f64 {
    if done {
        return reward;
    }
    let best = argmax(&online.q_values(next_state));
    reward + gamma * target.q_values(next_state)[best]
}

/// Index of the largest value; ties go to the lowest index
pub fn argmax(values: &Array1<f64>) -> usize {
    let mut best = 0;
    let mut best_value = f64::NEG_INFINITY;
    for (i, &v) in values.iter().enumerate() {
        if v > best_value {
            best = i;
            best_value = v;
        }
    }
    best
}

fn huber(x: f64, delta: f64) -> f64 {
    let abs = x.abs();
    if abs <= delta {
        0.5 * x * x
    } else {
        delta * (abs - 0.5 * delta)
    }
}

fn huber_grad(x: f64, delta: f64) -> f64 {
    x.clamp(-delta, delta)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rl::experience_store::Transition;
    use ndarray::array;

    fn config(target_update: TargetUpdate) -> EstimatorConfig {
        EstimatorConfig {
            hidden_layers: vec![16],
            learning_rate: 0.01,
            target_update,
            seed: 3,
            ..Default::default()
        }
    }

    fn batch_of(transitions: &[Transition]) -> SampledBatch<'_> {
        SampledBatch {
            transitions: transitions.iter().collect(),
            slots: (0..transitions.len()).collect(),
            weights: vec![1.0; transitions.len()],
            beta: 1.0,
        }
    }

    fn sample_transitions() -> Vec<Transition> {
        vec![
            Transition::new(array![0.1, 0.2, 0.3], 1, 1.0, array![0.2, 0.1, 0.0], false),
            Transition::new(array![-0.5, 0.0, 0.5], 2, -0.5, array![0.0, 0.0, 0.0], true),
            Transition::new(array![1.0, -1.0, 0.2], 0, 0.2, array![0.9, -0.8, 0.1], false),
        ]
    }

    #[test]
    fn test_argmax_breaks_ties_low() {
        assert_eq!(argmax(&array![1.0, 3.0, 3.0, 2.0]), 1);
        assert_eq!(argmax(&array![0.0, 0.0]), 0);
        assert_eq!(argmax(&array![-1.0, f64::NAN, -0.5]), 2);
    }

    #[test]
    fn test_huber() {
        assert_eq!(huber(0.5, 1.0), 0.125);
        assert_eq!(huber(3.0, 1.0), 2.5);
        assert_eq!(huber_grad(3.0, 1.0), 1.0);
        assert_eq!(huber_grad(-0.25, 1.0), -0.25);
    }

    #[test]
    fn test_dimension_mismatch() {
        let estimator = ValueEstimator::new(3, 4, config(TargetUpdate::default()));
        assert_eq!(estimator.q_values(&array![0.0, 0.0, 0.0]).unwrap().len(), 4);
        assert!(matches!(
            estimator.q_values(&array![0.0, 0.0]),
            Err(ModelError::DimensionMismatch {
                expected: 3,
                actual: 2
            })
        ));
    }

    #[test]
    fn test_terminal_target_is_reward() {
        let estimator = ValueEstimator::new(3, 4, config(TargetUpdate::default()));
        let y = estimator
            .bootstrap_target(0.75, &array![1.0, 2.0, 3.0], true)
            .unwrap();
        assert_eq!(y, 0.75);
    }

    #[test]
    fn test_target_selects_with_online_and_evaluates_with_target() {
        let estimator = ValueEstimator::new(3, 4, config(TargetUpdate::Hard { interval: 1_000 }));
        let transitions = sample_transitions();
        for _ in 0..20 {
            estimator.train_batch(&batch_of(&transitions)).unwrap();
        }
        let online = estimator.online_snapshot();
        let target = estimator.target_snapshot();
        assert!(!Arc::ptr_eq(&online, &target));

        let next = array![0.4, -0.3, 0.9];
        let best = argmax(&online.q_values(&next));
        let expected = 0.1 + estimator.config().gamma * target.q_values(&next)[best];
        let y = estimator.bootstrap_target(0.1, &next, false).unwrap();
        assert!((y - expected).abs() < 1e-12);
    }

    #[test]
    fn test_hard_sync_every_interval() {
        let estimator = ValueEstimator::new(3, 4, config(TargetUpdate::Hard { interval: 3 }));
        let transitions = sample_transitions();
        let initial_target = estimator.target_snapshot();

        let first = estimator.train_batch(&batch_of(&transitions)).unwrap();
        let second = estimator.train_batch(&batch_of(&transitions)).unwrap();
        assert!(!first.target_synced && !second.target_synced);
        assert!(Arc::ptr_eq(&estimator.target_snapshot(), &initial_target));

        let third = estimator.train_batch(&batch_of(&transitions)).unwrap();
        assert!(third.target_synced);
        assert_eq!(third.step, 3);
        assert!(Arc::ptr_eq(
            &estimator.target_snapshot(),
            &estimator.online_snapshot()
        ));
    }

    #[test]
    fn test_soft_update_blends_every_step() {
        let estimator = ValueEstimator::new(3, 4, config(TargetUpdate::Soft { tau: 0.5 }));
        let transitions = sample_transitions();
        let before = estimator.target_snapshot();
        let report = estimator.train_batch(&batch_of(&transitions)).unwrap();
        assert!(report.target_synced);
        let after = estimator.target_snapshot();
        assert_ne!(*before, *after);
        assert_ne!(*after, *estimator.online_snapshot());
    }

    #[test]
    fn test_training_reduces_td_error() {
        let estimator = ValueEstimator::new(3, 4, config(TargetUpdate::default()));
        let transitions = vec![Transition::new(
            array![0.5, -0.5, 1.0],
            3,
            1.0,
            array![0.0, 0.0, 0.0],
            true,
        )];
        let batch = batch_of(&transitions);
        let initial = estimator.train_batch(&batch).unwrap().td_errors[0].abs();
        let mut last = initial;
        for _ in 0..500 {
            last = estimator.train_batch(&batch).unwrap().td_errors[0].abs();
        }
        assert!(last < initial * 0.5, "initial {} final {}", initial, last);
        assert_eq!(estimator.steps(), 501);
    }

    #[test]
    fn test_report_has_one_td_error_per_transition() {
        let estimator = ValueEstimator::new(3, 4, config(TargetUpdate::default()));
        let transitions = sample_transitions();
        let report = estimator.train_batch(&batch_of(&transitions)).unwrap();
        assert_eq!(report.td_errors.len(), 3);
        assert!(report.loss >= 0.0);
    }

    #[test]
    fn test_invalid_action_rejected() {
        let estimator = ValueEstimator::new(3, 4, config(TargetUpdate::default()));
        let transitions = vec![Transition::new(
            array![0.0, 0.0, 0.0],
            9,
            0.0,
            array![0.0, 0.0, 0.0],
            true,
        )];
        assert!(matches!(
            estimator.train_batch(&batch_of(&transitions)),
            Err(ModelError::InvalidAction { action: 9, .. })
        ));
        assert_eq!(estimator.steps(), 0);
    }

    #[test]
    fn test_old_snapshot_unchanged_by_training() {
        let estimator = ValueEstimator::new(3, 4, config(TargetUpdate::default()));
        let state = array![0.3, 0.3, -0.3];
        let snapshot = estimator.online_snapshot();
        let before = snapshot.q_values(&state);

        estimator
            .train_batch(&batch_of(&sample_transitions()))
            .unwrap();

        assert_eq!(snapshot.q_values(&state), before);
        assert_ne!(estimator.q_values(&state).unwrap(), before);
    }

    #[test]
    fn test_concurrent_readers_see_complete_snapshots() {
        let estimator = ValueEstimator::new(3, 4, config(TargetUpdate::Hard { interval: 5 }));
        let transitions = sample_transitions();
        std::thread::scope(|scope| {
            for _ in 0..3 {
                scope.spawn(|| {
                    for _ in 0..200 {
                        let q = estimator.q_values(&array![0.1, 0.2, 0.3]).unwrap();
                        assert_eq!(q.len(), 4);
                        assert!(q.iter().all(|v| v.is_finite()));
                    }
                });
            }
            for _ in 0..50 {
                estimator.train_batch(&batch_of(&transitions)).unwrap();
            }
        });
        assert_eq!(estimator.steps(), 50);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("estimator.json");
        let estimator = ValueEstimator::new(3, 4, config(TargetUpdate::default()));
        estimator
            .train_batch(&batch_of(&sample_transitions()))
            .unwrap();
        estimator.save(&path).unwrap();

        let loaded = ValueEstimator::load(config(TargetUpdate::default()), &path).unwrap();
        let state = array![0.2, -0.1, 0.4];
        assert_eq!(loaded.steps(), 1);
        assert_eq!(loaded.state_size(), 3);
        let a = estimator.q_values(&state).unwrap();
        let b = loaded.q_values(&state).unwrap();
        for (x, y) in a.iter().zip(b.iter()) {
            assert!((x - y).abs() < 1e-12);
        }
    }
}
