//! Reinforcement learning core
//!
//! Prioritized experience replay, the dueling double-Q value estimator, epsilon-greedy
//! action selection and the learner tying them together.

mod experience_store;
mod learner;
mod network;
mod policy;
mod priority_index;
mod reward;
mod schedule;
mod value_estimator;

pub use experience_store::{
    ExperienceStore, SampledBatch, SharedExperienceStore, StoreCheckpoint, Tensor, Transition,
};
pub use learner::Learner;
pub use network::{combine, Dense, DuelingParams};
pub use policy::{decision_confidence, Decision, Policy, ValueCache};
pub use priority_index::{IndexCheckpoint, PriorityIndex};
pub use reward::step_reward;
pub use schedule::{beta_at, exploration_rate};
pub use value_estimator::{argmax, EstimatorSnapshot, TrainReport, ValueEstimator};
