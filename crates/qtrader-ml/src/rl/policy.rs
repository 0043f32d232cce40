//! Epsilon-greedy action selection with a per-step value cache.

use super::experience_store::Tensor;
use super::value_estimator::ValueEstimator;
use ndarray::Array1;
use qtrader_core::{ActionId, ModelError, TradeAction};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::trace;

#[derive(Debug, Clone)]
struct CacheEntry {
    step: u64,
    state: Tensor,
    values: Array1<f64>,
}

/// `Q(state, ·)` for the current decision step
///
/// Reused for selection and annotation within one step, recomputed whenever the step
/// or the state changes.
#[derive(Debug, Clone, Default)]
pub struct ValueCache {
    entry: Option<CacheEntry>,
    hits: u64,
    misses: u64,
}

impl ValueCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn values_for(
        &mut self,
        step: u64,
        state: &Tensor,
        estimator: &ValueEstimator,
    ) -> Result<&Array1<f64>, ModelError> {
        let fresh = matches!(&self.entry, Some(e) if e.step == step && e.state == *state);
        let entry = match self.entry.take() {
            Some(entry) if fresh => {
                self.hits += 1;
                entry
            }
            _ => {
                self.misses += 1;
                CacheEntry {
                    step,
                    state: state.clone(),
                    values: estimator.q_values(state)?,
                }
            }
        };
        Ok(&self.entry.insert(entry).values)
    }

    /// Values cached for `step`, if any
    pub fn peek(&self, step: u64) -> Option<&Array1<f64>> {
        self.entry
            .as_ref()
            .filter(|e| e.step == step)
            .map(|e| &e.values)
    }

    pub fn invalidate(&mut self) {
        self.entry = None;
    }

    pub fn hits(&self) -> u64 {
        self.hits
    }

    pub fn misses(&self) -> u64 {
        self.misses
    }
}

/// One action decision
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub action_id: ActionId,
    pub explored: bool,
    pub exploration_rate: f64,
    /// How decisively the estimator ranks the legal actions, in `[0.5, 1.0]`
    pub confidence: f64,
    pub q_values: Vec<f64>,
}

impl Decision {
    /// The trading action, `None` for indices outside the vocabulary
    pub fn action(&self) -> Option<TradeAction> {
        TradeAction::from_index(self.action_id)
    }
}

/// Epsilon-greedy selector; stateless apart from the estimator it reads
#[derive(Debug, Clone)]
pub struct Policy {
    estimator: Arc<ValueEstimator>,
}

impl Policy {
    pub fn new(estimator: Arc<ValueEstimator>) -> Self {
        Self { estimator }
    }

    pub fn estimator(&self) -> &Arc<ValueEstimator> {
        &self.estimator
    }

    /// Pick among the `legal` action ids
    ///
    /// Exploration draws uniformly from `legal`; the greedy choice is the legal argmax
    /// with ties going to the lowest id. An empty `legal` slice allows every action.
    pub fn select_action<R: Rng + ?Sized>(
        &self,
        cache: &mut ValueCache,
        step: u64,
        state: &Tensor,
        legal: &[ActionId],
        exploration_rate: f64,
        rng: &mut R,
    ) -> Result<Decision, ModelError> {
        let values = cache.values_for(step, state, &self.estimator)?;
        let legal = legal_ids(legal, values.len());
        let explored = rng.gen::<f64>() < exploration_rate;
        let action_id = if explored {
            legal[rng.gen_range(0..legal.len())]
        } else {
            legal_argmax(values, &legal)
        };
        let confidence = decision_confidence(values, &legal);

        trace!(
            step,
            action = action_id,
            explored,
            confidence,
            "Action selected"
        );

        Ok(Decision {
            action_id,
            explored,
            exploration_rate,
            confidence,
            q_values: values.to_vec(),
        })
    }
}

/// Sorted, deduplicated ids inside the value vector; all ids when none remain
fn legal_ids(legal: &[ActionId], n_actions: usize) -> Vec<ActionId> {
    let mut ids: Vec<ActionId> = legal.iter().copied().filter(|&a| a < n_actions).collect();
    ids.sort_unstable();
    ids.dedup();
    if ids.is_empty() {
        ids = (0..n_actions).collect();
    }
    ids
}

fn legal_argmax(values: &Array1<f64>, legal: &[ActionId]) -> ActionId {
    let mut best = legal[0];
    let mut best_value = f64::NEG_INFINITY;
    for &a in legal {
        if values[a] > best_value {
            best = a;
            best_value = values[a];
        }
    }
    best
}

/// `0.5 + 0.5 · (best − runner-up) / (best − worst)` over the legal values
///
/// 0.5 when the two best legal actions tie or fewer than two are legal, 1.0 when the
/// runner-up is as far behind the best as the worst action is.
pub fn decision_confidence(values: &Array1<f64>, legal: &[ActionId]) -> f64 {
    let mut ranked: Vec<f64> = legal
        .iter()
        .filter_map(|&a| values.get(a).copied())
        .filter(|v| v.is_finite())
        .collect();
    if ranked.len() < 2 {
        return 0.5;
    }
    ranked.sort_by(|a, b| b.total_cmp(a));
    let spread = ranked[0] - ranked[ranked.len() - 1];
    if spread <= 0.0 {
        return 0.5;
    }
    0.5 + 0.5 * (ranked[0] - ranked[1]) / spread
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rl::value_estimator::argmax;
    use ndarray::array;
    use qtrader_core::EstimatorConfig;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    const ALL: [ActionId; 4] = [0, 1, 2, 3];
    const FLAT: [ActionId; 3] = [0, 1, 2];
    const OPEN: [ActionId; 2] = [0, 3];

    fn policy() -> Policy {
        let config = EstimatorConfig {
            hidden_layers: vec![8],
            ..Default::default()
        };
        Policy::new(Arc::new(ValueEstimator::new(3, 4, config)))
    }

    #[test]
    fn test_greedy_picks_argmax() {
        let policy = policy();
        let mut cache = ValueCache::new();
        let mut rng = StdRng::seed_from_u64(1);
        let state = array![0.2, 0.4, -0.1];

        let decision = policy
            .select_action(&mut cache, 0, &state, &ALL, 0.0, &mut rng)
            .unwrap();
        let q = policy.estimator().q_values(&state).unwrap();
        assert!(!decision.explored);
        assert_eq!(decision.action_id, argmax(&q));
        assert!(decision.action().is_some());
    }

    #[test]
    fn test_greedy_stays_within_legal_actions() {
        let values = array![0.1, 0.2, 0.3, 0.9];
        assert_eq!(legal_argmax(&values, &FLAT), 2);
        assert_eq!(legal_argmax(&values, &OPEN), 3);
        assert_eq!(legal_argmax(&array![0.5, 0.5, 0.5, 0.0], &FLAT), 0);
    }

    #[test]
    fn test_full_exploration_is_uniform() {
        let policy = policy();
        let mut cache = ValueCache::new();
        let mut rng = StdRng::seed_from_u64(9);
        let state = array![0.0, 0.0, 0.0];
        let mut counts = [0usize; 4];
        let draws = 20_000;
        for step in 0..draws {
            let d = policy
                .select_action(&mut cache, step, &state, &ALL, 1.0, &mut rng)
                .unwrap();
            assert!(d.explored);
            counts[d.action_id] += 1;
        }
        for count in counts {
            let freq = count as f64 / draws as f64;
            assert!((freq - 0.25).abs() < 0.02, "frequency {}", freq);
        }
    }

    #[test]
    fn test_exploration_from_flat_never_closes() {
        let policy = policy();
        let mut cache = ValueCache::new();
        let mut rng = StdRng::seed_from_u64(4);
        let state = array![0.3, -0.2, 0.1];
        let mut counts = [0usize; 4];
        let draws = 9_000;
        for step in 0..draws {
            let d = policy
                .select_action(&mut cache, step, &state, &FLAT, 1.0, &mut rng)
                .unwrap();
            counts[d.action_id] += 1;
        }
        assert_eq!(counts[TradeAction::Close.to_index()], 0);
        for count in &counts[..3] {
            let freq = *count as f64 / draws as f64;
            assert!((freq - 1.0 / 3.0).abs() < 0.02, "frequency {}", freq);
        }

        for step in 0..1_000 {
            let d = policy
                .select_action(&mut cache, step, &state, &OPEN, 1.0, &mut rng)
                .unwrap();
            assert!(OPEN.contains(&d.action_id));
        }
    }

    #[test]
    fn test_empty_legal_set_allows_everything() {
        assert_eq!(legal_ids(&[], 4), vec![0, 1, 2, 3]);
        assert_eq!(legal_ids(&[3, 0, 3, 9], 4), vec![0, 3]);
    }

    #[test]
    fn test_cache_reused_within_step() {
        let policy = policy();
        let mut cache = ValueCache::new();
        let state = array![1.0, 2.0, 3.0];
        let first = cache.values_for(5, &state, policy.estimator()).unwrap().clone();
        let second = cache.values_for(5, &state, policy.estimator()).unwrap().clone();
        assert_eq!(first, second);
        assert_eq!(cache.misses(), 1);
        assert_eq!(cache.hits(), 1);
        assert!(cache.peek(5).is_some());
        assert!(cache.peek(6).is_none());
    }

    #[test]
    fn test_cache_recomputed_on_new_step_or_state() {
        let policy = policy();
        let mut cache = ValueCache::new();
        let a = array![1.0, 2.0, 3.0];
        let b = array![-1.0, 0.5, 0.0];

        cache.values_for(1, &a, policy.estimator()).unwrap();
        cache.values_for(2, &a, policy.estimator()).unwrap();
        let values_b = cache.values_for(2, &b, policy.estimator()).unwrap().clone();
        assert_eq!(cache.misses(), 3);
        assert_eq!(values_b, policy.estimator().q_values(&b).unwrap());

        cache.invalidate();
        assert!(cache.peek(2).is_none());
    }

    #[test]
    fn test_confidence_tracks_lead_over_runner_up() {
        // runner-up as far behind as the worst
        assert_eq!(decision_confidence(&array![1.0, 0.0, 0.0, 5.0], &FLAT), 1.0);
        // best and runner-up tie
        assert_eq!(decision_confidence(&array![1.0, 1.0, 0.0, 5.0], &FLAT), 0.5);
        // lead of a quarter of the spread
        assert_eq!(decision_confidence(&array![0.0, 0.75, 1.0, 0.0], &FLAT), 0.625);
        // scale free
        let small = decision_confidence(&array![0.0, 0.0075, 0.01, 0.0], &FLAT);
        let large = decision_confidence(&array![0.0, 75.0, 100.0, 0.0], &FLAT);
        assert!((small - large).abs() < 1e-12);
        assert_eq!(decision_confidence(&array![2.0, 2.0, 2.0, 2.0], &ALL), 0.5);
        assert_eq!(decision_confidence(&array![1.0, 0.0, 0.0, 0.0], &[0]), 0.5);
    }

    #[test]
    fn test_fresh_estimator_clears_default_threshold() {
        // an untrained network must still be able to open positions
        let policy = policy();
        let mut cache = ValueCache::new();
        let mut rng = StdRng::seed_from_u64(11);
        let mut passing = 0;
        for step in 0..200u64 {
            let x = step as f64 / 50.0 - 2.0;
            let state = array![x, -0.5 * x, (x * 3.0).sin()];
            let d = policy
                .select_action(&mut cache, step, &state, &FLAT, 1.0, &mut rng)
                .unwrap();
            assert!((0.5..=1.0).contains(&d.confidence));
            if d.confidence >= 0.55 {
                passing += 1;
            }
        }
        assert!(passing > 0);
    }
}
