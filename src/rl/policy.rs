// src/rl/policy.rs
//
// Action-selection policies over a Q-table row.
//
// Design:
// - Policy trait: maps a row of action values to the next profile
// - EpsilonGreedy: explores uniformly with probability ε, else exploits

use rand::{Rng, RngCore};

use super::qtable::ActionValues;
use crate::types::ReconProfile;

/// A selected profile plus whether it came from the exploration branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Selection {
    pub profile: ReconProfile,
    pub explored: bool,
}

/// Policy trait: interface for all action-selection strategies.
pub trait Policy: Send + Sync {
    /// Stable identifier for logs and telemetry.
    fn name(&self) -> &str;

    /// Pick the next profile for a state.
    fn select(&self, values: &ActionValues, rng: &mut dyn RngCore) -> Selection;
}

/// ε-greedy policy.
///
/// With probability ε the profile is drawn uniformly from all four (which
/// may coincide with the greedy choice); otherwise the highest-valued
/// profile is taken, ties resolved in canonical order.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpsilonGreedy {
    epsilon: f64,
}

impl EpsilonGreedy {
    pub fn new(epsilon: f64) -> Self {
        let epsilon = if epsilon.is_finite() {
            epsilon.clamp(0.0, 1.0)
        } else {
            0.0
        };
        Self { epsilon }
    }

    pub fn epsilon(&self) -> f64 {
        self.epsilon
    }
}

impl Policy for EpsilonGreedy {
    fn name(&self) -> &str {
        "epsilon-greedy"
    }

    fn select(&self, values: &ActionValues, rng: &mut dyn RngCore) -> Selection {
        if rng.gen_bool(self.epsilon) {
            let idx = rng.gen_range(0..ReconProfile::COUNT);
            return Selection {
                profile: ReconProfile::ALL[idx],
                explored: true,
            };
        }
        Selection {
            profile: values.best(),
            explored: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn exploration_fraction_converges_to_epsilon() {
        let policy = EpsilonGreedy::new(0.1);
        let values = ActionValues::new([0.0, 5.0, 1.0, -1.0]);
        let mut rng = ChaCha8Rng::seed_from_u64(42);
        let n = 50_000;
        let mut explored = 0usize;
        let mut off_best = 0usize;
        for _ in 0..n {
            let s = policy.select(&values, &mut rng);
            explored += s.explored as usize;
            off_best += (s.profile != ReconProfile::Stealth) as usize;
        }
        let explored = explored as f64 / n as f64;
        let off_best = off_best as f64 / n as f64;
        assert!((explored - 0.1).abs() < 0.01, "explored {explored}");
        // Uniform exploration lands on the best action a quarter of the time.
        assert!((off_best - 0.075).abs() < 0.01, "off-best {off_best}");
    }

    #[test]
    fn zero_epsilon_is_greedy() {
        let policy = EpsilonGreedy::new(0.0);
        let values = ActionValues::new([0.0, 0.0, 3.0, 3.0]);
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        for _ in 0..1_000 {
            let s = policy.select(&values, &mut rng);
            assert_eq!(s.profile, ReconProfile::Aggressive);
            assert!(!s.explored);
        }
    }

    #[test]
    fn epsilon_is_clamped() {
        assert_eq!(EpsilonGreedy::new(4.0).epsilon(), 1.0);
        assert_eq!(EpsilonGreedy::new(-1.0).epsilon(), 0.0);
        assert_eq!(EpsilonGreedy::new(f64::NAN).epsilon(), 0.0);
    }
}
