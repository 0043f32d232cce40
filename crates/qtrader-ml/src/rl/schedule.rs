//! Step-driven schedules for exploration and importance sampling.
//!
//! Both are pure functions of a step counter owned by the training loop.

use qtrader_core::ExplorationConfig;

/// Epsilon for `step`: exponential decay from `start` toward `floor`
pub fn exploration_rate(step: u64, config: &ExplorationConfig) -> f64 {
    let exponent = step.min(i32::MAX as u64) as i32;
    let rate = config.floor + (config.start - config.floor) * config.decay.powi(exponent);
    rate.clamp(config.floor, config.start)
}

/// Importance-sampling exponent for `step`: linear from `start` to 1.0 over `anneal_steps`
pub fn beta_at(step: u64, start: f64, anneal_steps: u64) -> f64 {
    if anneal_steps == 0 {
        return 1.0;
    }
    let progress = (step as f64 / anneal_steps as f64).min(1.0);
    (start + (1.0 - start) * progress).min(1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exploration_starts_at_start() {
        let config = ExplorationConfig::default();
        assert_eq!(exploration_rate(0, &config), 1.0);
    }

    #[test]
    fn test_exploration_monotone_and_floored() {
        let config = ExplorationConfig {
            start: 1.0,
            floor: 0.05,
            decay: 0.99,
        };
        let mut previous = f64::MAX;
        for step in (0..5_000).step_by(7) {
            let rate = exploration_rate(step, &config);
            assert!(rate <= previous);
            assert!(rate >= config.floor);
            previous = rate;
        }
        assert!((exploration_rate(u64::MAX, &config) - 0.05).abs() < 1e-12);
    }

    #[test]
    fn test_beta_anneals_linearly() {
        assert_eq!(beta_at(0, 0.4, 100), 0.4);
        assert!((beta_at(50, 0.4, 100) - 0.7).abs() < 1e-12);
        assert_eq!(beta_at(100, 0.4, 100), 1.0);
        assert_eq!(beta_at(1_000, 0.4, 100), 1.0);
        assert_eq!(beta_at(10, 0.4, 0), 1.0);
    }
}
