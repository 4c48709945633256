// src/rl/learner.rs
//
// Per-epoch Q-learning pass.
//
// One pass updates the global state once and every AP-local state once:
//
//   reward = Δhandshakes * reward_per_handshake - blind * blind_penalty
//   Q(s,·) *= decay
//   Q(s,a) += α (reward + γ max Q(s,·) - Q(s,a))     a = profile currently assigned
//   a'     = policy(Q(s,·))                          new assignment
//
// The caller passes the registry by `&mut`, i.e. with its lock held for the
// whole pass, so reward deltas and profile assignments are taken from one
// consistent snapshot.

use std::collections::BTreeMap;

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::Serialize;
use tracing::debug;

use super::policy::{EpsilonGreedy, Policy};
use super::qtable::{DecisionState, QTable};
use crate::config::LearningConfig;
use crate::registry::Registry;
use crate::types::{hour_bucket, ReconProfile, TimestampMs};

/// What one learning pass did (fed to epoch telemetry).
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LearnOutcome {
    pub global_state: DecisionState,
    pub global_reward: f64,
    pub global_profile: ReconProfile,
    pub explored: bool,
    pub ap_updates: usize,
    pub states: usize,
    pub pruned: usize,
}

pub struct QLearner {
    cfg: LearningConfig,
    table: QTable,
    policy: Box<dyn Policy>,
    current: ReconProfile,
    last_handshakes: u64,
    rng: ChaCha8Rng,
}

impl QLearner {
    pub fn new(cfg: LearningConfig) -> Self {
        Self::with_table(cfg, QTable::new())
    }

    pub fn with_table(cfg: LearningConfig, table: QTable) -> Self {
        let rng = match cfg.seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed),
            None => ChaCha8Rng::from_entropy(),
        };
        let policy = Box::new(EpsilonGreedy::new(cfg.epsilon));
        Self {
            cfg,
            table,
            policy,
            current: ReconProfile::default(),
            last_handshakes: 0,
            rng,
        }
    }

    /// Swap the selection policy.
    pub fn with_policy(mut self, policy: Box<dyn Policy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn config(&self) -> &LearningConfig {
        &self.cfg
    }

    pub fn table(&self) -> &QTable {
        &self.table
    }

    pub fn replace_table(&mut self, table: QTable) {
        self.table = table;
    }

    /// Current global profile.
    pub fn current(&self) -> ReconProfile {
        self.current
    }

    pub fn policy_name(&self) -> &str {
        self.policy.name()
    }

    fn reward(&self, delta_handshakes: u64, blind: u32) -> f64 {
        delta_handshakes as f64 * self.cfg.reward_per_handshake
            - blind as f64 * self.cfg.blind_penalty
    }

    /// Decay, TD-update the `taken` action, and pick the next action for
    /// `state`. Initialises the row on first visit.
    pub fn update_state(
        &mut self,
        state: DecisionState,
        taken: ReconProfile,
        reward: f64,
    ) -> (ReconProfile, bool) {
        let alpha = self.cfg.learning_rate;
        let gamma = self.cfg.discount_factor;
        let decay = self.cfg.decay;
        let row = self
            .table
            .entry_or_init(state, &mut self.rng, self.cfg.prior_range);

        row.decay(decay);
        let q = row.get(taken);
        let target = reward + gamma * row.max_value();
        row.set(taken, q + alpha * (target - q));

        let row = *row;
        let selection = self.policy.select(&row, &mut self.rng);
        (selection.profile, selection.explored)
    }

    /// Run one learning pass over the global state and every AP.
    pub fn learn(
        &mut self,
        registry: &mut Registry,
        blind: u32,
        session_handshakes: u64,
        now: TimestampMs,
    ) -> LearnOutcome {
        let hour = hour_bucket(now);

        let global_state =
            DecisionState::global(blind, registry.ap_count(), registry.client_count(), hour);
        let delta = session_handshakes.saturating_sub(self.last_handshakes);
        self.last_handshakes = session_handshakes;
        let global_reward = self.reward(delta, blind);
        let (next, explored) = self.update_state(global_state, self.current, global_reward);
        debug!(
            state = ?global_state,
            reward = global_reward,
            from = %self.current,
            to = %next,
            explored,
            "global q-update"
        );
        self.current = next;
        registry.set_default_recon(next);

        let mut ap_updates = 0usize;
        let aps: Vec<(String, DecisionState, u64, ReconProfile)> = registry
            .aps()
            .iter()
            .map(|(mac, ap)| {
                let delta = ap.handshakes.saturating_sub(ap.prev_handshakes) as u64;
                (
                    mac.clone(),
                    DecisionState::local(blind, ap.clients.len(), hour),
                    delta,
                    ap.recon,
                )
            })
            .collect();
        let mut assignments = BTreeMap::new();
        for (mac, state, delta, taken) in aps {
            let reward = self.reward(delta, blind);
            let (profile, _) = self.update_state(state, taken, reward);
            assignments.insert(mac, profile);
            ap_updates += 1;
        }
        for (mac, ap) in registry.aps_mut() {
            ap.prev_handshakes = ap.handshakes;
            if let Some(profile) = assignments.get(mac) {
                ap.recon = *profile;
            }
        }

        let pruned = self
            .table
            .prune(self.cfg.max_states, self.cfg.prune_batch, &global_state);
        if pruned > 0 {
            debug!(pruned, remaining = self.table.len(), "pruned q-table");
        }

        LearnOutcome {
            global_state,
            global_reward,
            global_profile: next,
            explored,
            ap_updates,
            states: self.table.len(),
            pruned,
        }
    }
}
