//! Prioritized experience replay.
//!
//! A fixed-capacity ring of transitions paired slot-for-slot with a [`PriorityIndex`].
//! New transitions enter at the highest priority seen so far so each is sampled at
//! least once before its TD error is known.

use super::priority_index::{IndexCheckpoint, PriorityIndex};
use ndarray::Array1;
use parking_lot::Mutex;
use qtrader_core::{ActionId, IndexError, ReplayConfig, StoreError};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// Encoded market state
pub type Tensor = Array1<f64>;

/// A single experience tuple (s, a, r, s', done)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    pub state: Tensor,
    pub action: ActionId,
    pub reward: f64,
    pub next_state: Tensor,
    pub done: bool,
    /// Sampling priority; the only field that changes after insertion
    pub priority: f64,
}

impl Transition {
    pub fn new(state: Tensor, action: ActionId, reward: f64, next_state: Tensor, done: bool) -> Self {
        Self {
            state,
            action,
            reward,
            next_state,
            done,
            priority: 0.0,
        }
    }
}

/// Transitions drawn for one training step
///
/// Transitions are borrowed from the store; `slots[i]` and `weights[i]` belong to
/// `transitions[i]`.
#[derive(Debug)]
pub struct SampledBatch<'a> {
    pub transitions: Vec<&'a Transition>,
    pub slots: Vec<usize>,
    /// Importance-sampling weights, normalized so the largest is 1.0
    pub weights: Vec<f64>,
    pub beta: f64,
}

impl SampledBatch<'_> {
    pub fn len(&self) -> usize {
        self.transitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transitions.is_empty()
    }
}

/// Persisted replay state for resumable training
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreCheckpoint {
    /// Slot priorities and write cursor
    pub priorities: IndexCheckpoint,
    pub max_priority: f64,
    pub transitions: Vec<Transition>,
}

/// Store shared between the acting and training tasks
///
/// One mutex guards the whole store, so every index write finishes its propagation
/// before another write or a sample can begin.
pub type SharedExperienceStore = Arc<Mutex<ExperienceStore>>;

/// Prioritized replay buffer
#[derive(Debug)]
pub struct ExperienceStore {
    config: ReplayConfig,
    slots: Vec<Option<Transition>>,
    /// Times each slot has been written
    generations: Vec<u64>,
    index: PriorityIndex,
    max_priority: f64,
}

impl ExperienceStore {
    pub fn new(config: ReplayConfig) -> Result<Self, StoreError> {
        let index = PriorityIndex::new(config.capacity)?;
        Ok(Self {
            slots: vec![None; config.capacity],
            generations: vec![0; config.capacity],
            index,
            max_priority: 1.0,
            config,
        })
    }

    pub fn into_shared(self) -> SharedExperienceStore {
        Arc::new(Mutex::new(self))
    }

    pub fn config(&self) -> &ReplayConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.index.capacity()
    }

    /// Whether enough transitions are stored to start training
    pub fn is_ready(&self) -> bool {
        self.len() >= self.config.min_experiences.max(self.config.batch_size)
    }

    pub fn max_priority(&self) -> f64 {
        self.max_priority
    }

    pub fn total_priority(&self) -> f64 {
        self.index.total_weight()
    }

    pub fn get(&self, slot: usize) -> Option<&Transition> {
        self.slots.get(slot).and_then(|t| t.as_ref())
    }

    /// Store a transition at the write cursor with the maximal seen priority
    pub fn add(&mut self, mut transition: Transition) -> Result<usize, StoreError> {
        let slot = self.index.insert(self.max_priority)?;
        transition.priority = self.max_priority;
        self.slots[slot] = Some(transition);
        self.generations[slot] += 1;
        Ok(slot)
    }

    /// Write count of `slot`; changes whenever the ring overwrites it
    pub fn generation(&self, slot: usize) -> u64 {
        self.generations.get(slot).copied().unwrap_or(0)
    }

    /// Like [`update_priorities`](Self::update_priorities), skipping slots rewritten
    /// since `generations` were read
    ///
    /// Returns how many priorities were written.
    pub fn update_current_priorities(
        &mut self,
        slots: &[usize],
        generations: &[u64],
        td_errors: &[f64],
    ) -> Result<usize, StoreError> {
        if slots.len() != td_errors.len() || slots.len() != generations.len() {
            return Err(StoreError::LengthMismatch {
                slots: slots.len(),
                priorities: td_errors.len(),
            });
        }
        let (current, errors): (Vec<usize>, Vec<f64>) = slots
            .iter()
            .zip(generations)
            .zip(td_errors)
            .filter(|((&slot, &generation), _)| self.generation(slot) == generation)
            .map(|((&slot, _), &td)| (slot, td))
            .unzip();
        if current.len() < slots.len() {
            debug!(
                stale = slots.len() - current.len(),
                "Skipped priorities of overwritten slots"
            );
        }
        self.update_priorities(&current, &errors)?;
        Ok(current.len())
    }

    /// Draw `n` transitions by stratified proportional sampling
    ///
    /// `[0, total)` is split into `n` equal segments with one uniform draw in each.
    pub fn sample_batch<R: Rng + ?Sized>(
        &self,
        n: usize,
        beta: f64,
        rng: &mut R,
    ) -> Result<SampledBatch<'_>, StoreError> {
        let total = self.index.total_weight();
        if self.is_empty() || total <= 0.0 {
            return Err(IndexError::Empty.into());
        }
        if n == 0 {
            return Ok(SampledBatch {
                transitions: Vec::new(),
                slots: Vec::new(),
                weights: Vec::new(),
                beta,
            });
        }

        let live = self.len() as f64;
        let segment = total / n as f64;
        let mut transitions = Vec::with_capacity(n);
        let mut slots = Vec::with_capacity(n);
        let mut weights = Vec::with_capacity(n);

        for i in 0..n {
            let low = segment * i as f64;
            let high = (segment * (i + 1) as f64).min(total);
            let r = if high > low {
                rng.gen_range(low..high)
            } else {
                low
            };
            let slot = self.index.sample(r)?;
            let priority = self.index.weight(slot).ok_or(StoreError::EmptySlot(slot))?;
            let transition = self.get(slot).ok_or(StoreError::EmptySlot(slot))?;

            let probability = priority / total;
            weights.push((live * probability).powf(-beta));
            slots.push(slot);
            transitions.push(transition);
        }

        let max_weight = weights.iter().cloned().fold(f64::MIN, f64::max);
        if max_weight > 0.0 && max_weight.is_finite() {
            for w in weights.iter_mut() {
                *w /= max_weight;
            }
        }

        Ok(SampledBatch {
            transitions,
            slots,
            weights,
            beta,
        })
    }

    /// Write back `(|td| + epsilon)^alpha` for each sampled slot
    ///
    /// All priorities are validated before any is written.
    pub fn update_priorities(&mut self, slots: &[usize], td_errors: &[f64]) -> Result<(), StoreError> {
        if slots.len() != td_errors.len() {
            return Err(StoreError::LengthMismatch {
                slots: slots.len(),
                priorities: td_errors.len(),
            });
        }

        let priorities: Vec<f64> = td_errors
            .iter()
            .map(|td| (td.abs() + self.config.priority_epsilon).powf(self.config.alpha))
            .collect();

        for (&slot, &priority) in slots.iter().zip(&priorities) {
            if slot >= self.len() {
                return Err(IndexError::SlotOutOfRange {
                    slot,
                    capacity: self.len(),
                }
                .into());
            }
            if !(priority.is_finite() && priority > 0.0) {
                return Err(IndexError::InvalidWeight {
                    slot,
                    weight: priority,
                }
                .into());
            }
        }

        for (&slot, &priority) in slots.iter().zip(&priorities) {
            self.index.update(slot, priority)?;
            if let Some(t) = self.slots[slot].as_mut() {
                t.priority = priority;
            }
            if priority > self.max_priority {
                self.max_priority = priority;
            }
        }

        debug!(
            updated = slots.len(),
            max_priority = self.max_priority,
            total = self.index.total_weight(),
            "Updated replay priorities"
        );
        Ok(())
    }

    pub fn checkpoint(&self) -> StoreCheckpoint {
        StoreCheckpoint {
            priorities: self.index.checkpoint(),
            max_priority: self.max_priority,
            transitions: self.slots[..self.len()]
                .iter()
                .filter_map(|t| t.clone())
                .collect(),
        }
    }

    pub fn restore(config: ReplayConfig, checkpoint: StoreCheckpoint) -> Result<Self, StoreError> {
        if checkpoint.priorities.capacity != config.capacity {
            return Err(StoreError::CheckpointMismatch {
                expected: config.capacity,
                actual: checkpoint.priorities.capacity,
            });
        }
        if checkpoint.transitions.len() != checkpoint.priorities.weights.len() {
            return Err(StoreError::CheckpointMismatch {
                expected: checkpoint.priorities.weights.len(),
                actual: checkpoint.transitions.len(),
            });
        }

        let index = PriorityIndex::restore(&checkpoint.priorities)?;
        let mut slots = vec![None; config.capacity];
        let mut generations = vec![0; config.capacity];
        for (slot, transition) in checkpoint.transitions.into_iter().enumerate() {
            slots[slot] = Some(transition);
            generations[slot] = 1;
        }
        Ok(Self {
            config,
            slots,
            generations,
            index,
            max_priority: checkpoint.max_priority.max(1.0),
        })
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), StoreError> {
        let json = serde_json::to_string(&self.checkpoint())?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn load(config: ReplayConfig, path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let json = std::fs::read_to_string(path)?;
        let checkpoint: StoreCheckpoint = serde_json::from_str(&json)?;
        Self::restore(config, checkpoint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr1;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn config(capacity: usize) -> ReplayConfig {
        ReplayConfig {
            capacity,
            batch_size: 4,
            min_experiences: 4,
            ..ReplayConfig::default()
        }
    }

    fn transition(i: usize) -> Transition {
        Transition::new(
            arr1(&[i as f64, 0.0]),
            i % 4,
            i as f64,
            arr1(&[i as f64 + 1.0, 0.0]),
            false,
        )
    }

    fn filled(capacity: usize) -> ExperienceStore {
        let mut store = ExperienceStore::new(config(capacity)).unwrap();
        for i in 0..capacity {
            store.add(transition(i)).unwrap();
        }
        store
    }

    #[test]
    fn test_add_uses_max_priority() {
        let mut store = filled(4);
        assert_eq!(store.get(0).unwrap().priority, 1.0);

        store.update_priorities(&[2], &[3.0]).unwrap();
        let expected = (3.0f64 + 1e-6).powf(0.6);
        assert!((store.max_priority() - expected).abs() < 1e-12);

        let slot = store.add(transition(9)).unwrap();
        assert_eq!(slot, 0);
        assert!((store.get(0).unwrap().priority - expected).abs() < 1e-12);
    }

    #[test]
    fn test_ring_replaces_oldest() {
        let mut store = ExperienceStore::new(config(3)).unwrap();
        for i in 0..5 {
            store.add(transition(i)).unwrap();
        }
        assert_eq!(store.len(), 3);
        assert_eq!(store.get(0).unwrap().reward, 3.0);
        assert_eq!(store.get(1).unwrap().reward, 4.0);
        assert_eq!(store.get(2).unwrap().reward, 2.0);
        assert!((store.total_priority() - 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_equal_priorities_sample_near_uniformly() {
        let store = filled(10);
        let mut rng = StdRng::seed_from_u64(1);
        let mut counts = [0usize; 10];
        let rounds = 5_000;
        for _ in 0..rounds {
            let batch = store.sample_batch(10, 0.4, &mut rng).unwrap();
            assert!(batch.weights.iter().all(|w| (*w - 1.0).abs() < 1e-9));
            for slot in batch.slots {
                counts[slot] += 1;
            }
        }
        let expected = rounds as f64;
        for count in counts {
            assert!((count as f64 - expected).abs() / expected < 0.05);
        }
    }

    #[test]
    fn test_dominant_priority_is_sampled_almost_always() {
        let mut store = filled(8);
        let slots: Vec<usize> = (0..8).collect();
        let mut errors = vec![1e-9; 8];
        errors[5] = 1e9;
        store.update_priorities(&slots, &errors).unwrap();

        let mut rng = StdRng::seed_from_u64(2);
        let batch = store.sample_batch(64, 1.0, &mut rng).unwrap();
        let hits = batch.slots.iter().filter(|&&s| s == 5).count();
        assert!(hits as f64 / 64.0 > 0.95);
    }

    #[test]
    fn test_importance_weights_normalized() {
        let mut store = filled(4);
        store
            .update_priorities(&[0, 1, 2, 3], &[0.1, 1.0, 5.0, 20.0])
            .unwrap();
        let mut rng = StdRng::seed_from_u64(3);
        let batch = store.sample_batch(16, 0.5, &mut rng).unwrap();
        let max = batch.weights.iter().cloned().fold(f64::MIN, f64::max);
        assert!((max - 1.0).abs() < 1e-12);
        assert!(batch.weights.iter().all(|w| *w > 0.0 && *w <= 1.0));

        // rarer slots carry larger correction
        let low = batch.slots.iter().position(|&s| s == 0);
        let high = batch.slots.iter().position(|&s| s == 3);
        if let (Some(l), Some(h)) = (low, high) {
            assert!(batch.weights[l] > batch.weights[h]);
        }
    }

    #[test]
    fn test_same_seed_same_batch() {
        let mut store = filled(16);
        store
            .update_priorities(&[1, 4, 9], &[2.0, 0.5, 7.0])
            .unwrap();
        let a = store
            .sample_batch(8, 0.4, &mut StdRng::seed_from_u64(99))
            .unwrap()
            .slots;
        let b = store
            .sample_batch(8, 0.4, &mut StdRng::seed_from_u64(99))
            .unwrap()
            .slots;
        assert_eq!(a, b);
    }

    #[test]
    fn test_overwritten_slots_keep_fresh_priority() {
        let mut store = filled(4);
        let generations: Vec<u64> = (0..4).map(|slot| store.generation(slot)).collect();
        assert_eq!(generations, vec![1; 4]);

        // slot 0 is rewritten while the sampled batch is being trained on
        store.add(transition(10)).unwrap();
        assert_eq!(store.generation(0), 2);

        let written = store
            .update_current_priorities(&[0, 2], &[generations[0], generations[2]], &[3.0, 3.0])
            .unwrap();
        assert_eq!(written, 1);
        assert_eq!(store.get(0).unwrap().priority, 1.0);
        assert!(store.get(2).unwrap().priority > 1.0);
    }

    #[test]
    fn test_update_validates_before_writing() {
        let mut store = filled(4);
        let before = store.total_priority();
        let result = store.update_priorities(&[0, 1], &[2.0, f64::NAN]);
        assert!(matches!(
            result,
            Err(StoreError::Index(IndexError::InvalidWeight { slot: 1, .. }))
        ));
        assert_eq!(store.total_priority(), before);

        assert!(matches!(
            store.update_priorities(&[0], &[1.0, 2.0]),
            Err(StoreError::LengthMismatch { .. })
        ));
        assert!(matches!(
            store.update_priorities(&[7], &[1.0]),
            Err(StoreError::Index(IndexError::SlotOutOfRange { .. }))
        ));
    }

    #[test]
    fn test_sample_empty_store() {
        let store = ExperienceStore::new(config(4)).unwrap();
        let mut rng = StdRng::seed_from_u64(0);
        assert!(matches!(
            store.sample_batch(2, 0.4, &mut rng),
            Err(StoreError::Index(IndexError::Empty))
        ));
    }

    #[test]
    fn test_checkpoint_file_round_trip() {
        let mut store = filled(6);
        store.add(transition(6)).unwrap();
        store.update_priorities(&[3], &[4.0]).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("replay.json");
        store.save(&path).unwrap();

        let restored = ExperienceStore::load(config(6), &path).unwrap();
        assert_eq!(restored.len(), 6);
        assert_eq!(restored.index.cursor(), 1);
        assert!((restored.total_priority() - store.total_priority()).abs() < 1e-12);
        assert_eq!(restored.get(0), store.get(0));
        assert_eq!(restored.max_priority(), store.max_priority());

        assert!(matches!(
            ExperienceStore::load(config(8), &path),
            Err(StoreError::CheckpointMismatch { .. })
        ));
    }
}
