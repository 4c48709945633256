// src/rl/mod.rs
//
// Tabular reinforcement learning for operating-profile selection.
//
// Key components:
// - QTable: state → per-profile values, lazily initialised, pruned at a cap
// - Policy: action selection over a table row (ε-greedy)
// - QLearner: one decay + TD update per state per epoch, global and per-AP

pub mod learner;
pub mod policy;
pub mod qtable;

pub use learner::{LearnOutcome, QLearner};
pub use policy::{EpsilonGreedy, Policy, Selection};
pub use qtable::{ActionValues, DecisionState, QTable};
