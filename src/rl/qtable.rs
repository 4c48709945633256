// src/rl/qtable.rs
//
// Tabular state → action value store.
//
// States and actions are plain value types with structural equality and a
// total order, so the table is an ordinary ordered map. Each state always
// carries a value for all four profiles: the action row is a fixed-size
// array indexed by `ReconProfile::index()`.

use std::collections::BTreeMap;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::types::{parse_int_tuple, ReconProfile};

/// Discrete decision state.
///
/// `scope_size` is the AP count for the global state and 1 for an AP-local
/// state. Field order defines the derived ordering (blind epochs first).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DecisionState {
    pub blind_epochs: u32,
    pub scope_size: u32,
    pub client_count: u32,
    pub time_bucket: u8,
}

impl DecisionState {
    pub fn global(blind_epochs: u32, ap_count: usize, client_count: usize, hour: u8) -> Self {
        Self {
            blind_epochs,
            scope_size: ap_count as u32,
            client_count: client_count as u32,
            time_bucket: hour,
        }
    }

    pub fn local(blind_epochs: u32, client_count: usize, hour: u8) -> Self {
        Self {
            blind_epochs,
            scope_size: 1,
            client_count: client_count as u32,
            time_bucket: hour,
        }
    }

    /// Parse the legacy stringified key form `"(blind, scope, clients, hour)"`.
    pub fn parse_legacy(s: &str) -> Option<Self> {
        let fields = parse_int_tuple(s)?;
        match fields.as_slice() {
            [b, s, c, h] => Some(Self {
                blind_epochs: u32::try_from(*b).ok()?,
                scope_size: u32::try_from(*s).ok()?,
                client_count: u32::try_from(*c).ok()?,
                time_bucket: u8::try_from(*h).ok().filter(|h| *h < 24)?,
            }),
            _ => None,
        }
    }
}

/// Values of the four profiles for one state.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ActionValues([f64; ReconProfile::COUNT]);

impl ActionValues {
    pub fn new(values: [f64; ReconProfile::COUNT]) -> Self {
        Self(values)
    }

    /// Uniform priors in `[-range, range]`; breaks ties and nudges early
    /// exploration.
    pub fn with_priors<R: Rng + ?Sized>(rng: &mut R, range: f64) -> Self {
        let range = range.abs();
        let mut values = [0.0; ReconProfile::COUNT];
        if range > 0.0 {
            for v in &mut values {
                *v = rng.gen_range(-range..=range);
            }
        }
        Self(values)
    }

    pub fn get(&self, profile: ReconProfile) -> f64 {
        self.0[profile.index()]
    }

    pub fn set(&mut self, profile: ReconProfile, value: f64) {
        self.0[profile.index()] = value;
    }

    pub fn as_array(&self) -> &[f64; ReconProfile::COUNT] {
        &self.0
    }

    pub fn iter(&self) -> impl Iterator<Item = (ReconProfile, f64)> + '_ {
        ReconProfile::ALL.iter().map(move |p| (*p, self.get(*p)))
    }

    pub fn max_value(&self) -> f64 {
        self.0.iter().copied().fold(f64::NEG_INFINITY, f64::max)
    }

    /// Highest-valued profile; ties go to the earliest in canonical order.
    pub fn best(&self) -> ReconProfile {
        let mut best = ReconProfile::ALL[0];
        for (p, v) in self.iter().skip(1) {
            if v > self.get(best) {
                best = p;
            }
        }
        best
    }

    /// Multiply every value by `factor`.
    pub fn decay(&mut self, factor: f64) {
        for v in &mut self.0 {
            *v *= factor;
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct QTable {
    states: BTreeMap<DecisionState, ActionValues>,
}

impl QTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn get(&self, state: &DecisionState) -> Option<&ActionValues> {
        self.states.get(state)
    }

    pub fn insert(&mut self, state: DecisionState, values: ActionValues) {
        self.states.insert(state, values);
    }

    pub fn contains(&self, state: &DecisionState) -> bool {
        self.states.contains_key(state)
    }

    /// Row for `state`, initialised with random priors on first visit.
    pub fn entry_or_init<R: Rng + ?Sized>(
        &mut self,
        state: DecisionState,
        rng: &mut R,
        prior_range: f64,
    ) -> &mut ActionValues {
        self.states
            .entry(state)
            .or_insert_with(|| ActionValues::with_priors(rng, prior_range))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&DecisionState, &ActionValues)> {
        self.states.iter()
    }

    /// When the table holds more than `max_states`, evict up to `batch`
    /// states with the smallest time bucket, never touching `keep`.
    ///
    /// The time bucket is a cyclical stand-in for recency. Returns the
    /// number of evicted states.
    pub fn prune(&mut self, max_states: usize, batch: usize, keep: &DecisionState) -> usize {
        if self.states.len() <= max_states {
            return 0;
        }
        let mut candidates: Vec<DecisionState> = self
            .states
            .keys()
            .filter(|s| *s != keep)
            .copied()
            .collect();
        candidates.sort_by_key(|s| (s.time_bucket, *s));
        candidates.truncate(batch);
        for s in &candidates {
            self.states.remove(s);
        }
        candidates.len()
    }

    /// Up to `n` states ranked by their best action value, descending.
    pub fn top_by_best(&self, n: usize) -> Vec<(DecisionState, ActionValues)> {
        let mut rows: Vec<(DecisionState, ActionValues)> =
            self.states.iter().map(|(s, v)| (*s, *v)).collect();
        rows.sort_by(|a, b| b.1.max_value().total_cmp(&a.1.max_value()));
        rows.truncate(n);
        rows
    }

    /// The last `n` states in key order (blind epochs first).
    pub fn tail_by_blind(&self, n: usize) -> Vec<(DecisionState, ActionValues)> {
        let skip = self.states.len().saturating_sub(n);
        self.states
            .iter()
            .skip(skip)
            .map(|(s, v)| (*s, *v))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn state(blind: u32, clients: u32, hour: u8) -> DecisionState {
        DecisionState {
            blind_epochs: blind,
            scope_size: 1,
            client_count: clients,
            time_bucket: hour,
        }
    }

    #[test]
    fn priors_stay_in_range_and_every_profile_present() {
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let mut table = QTable::new();
        for i in 0..50 {
            let row = *table.entry_or_init(state(i, 0, 0), &mut rng, 0.1);
            assert_eq!(row.iter().count(), ReconProfile::COUNT);
            assert!(row.as_array().iter().all(|v| (-0.1..=0.1).contains(v)));
        }
    }

    #[test]
    fn entry_or_init_keeps_existing_row() {
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let mut table = QTable::new();
        table.insert(state(0, 0, 0), ActionValues::new([1.0, 2.0, 3.0, 4.0]));
        let row = table.entry_or_init(state(0, 0, 0), &mut rng, 0.1);
        assert_eq!(row.get(ReconProfile::Greed), 4.0);
    }

    #[test]
    fn best_breaks_ties_in_canonical_order() {
        let v = ActionValues::new([0.5, 0.9, 0.9, 0.1]);
        assert_eq!(v.best(), ReconProfile::Stealth);
        assert_eq!(ActionValues::default().best(), ReconProfile::Lite);
        assert_eq!(v.max_value(), 0.9);
    }

    #[test]
    fn decay_is_geometric() {
        let mut v = ActionValues::new([1.0, -2.0, 4.0, 0.0]);
        for _ in 0..10 {
            v.decay(0.99);
        }
        let f = 0.99f64.powi(10);
        assert!((v.get(ReconProfile::Lite) - f).abs() < 1e-12);
        assert!((v.get(ReconProfile::Stealth) + 2.0 * f).abs() < 1e-12);
        assert!((v.get(ReconProfile::Aggressive) - 4.0 * f).abs() < 1e-12);
        assert_eq!(v.get(ReconProfile::Greed), 0.0);
    }

    #[test]
    fn prune_evicts_smallest_buckets_but_keeps_pinned_state() {
        let mut table = QTable::new();
        for i in 0..1_001u32 {
            table.insert(state(i, i % 7, (i % 24) as u8), ActionValues::default());
        }
        let keep = state(0, 0, 0);
        assert!(table.contains(&keep));
        let evicted = table.prune(1_000, 100, &keep);
        assert_eq!(evicted, 100);
        assert!(table.len() <= 901);
        assert!(table.contains(&keep));
        assert_eq!(table.prune(1_000, 100, &keep), 0);
    }

    #[test]
    fn legacy_key_parsing() {
        assert_eq!(
            DecisionState::parse_legacy("(2, 1, 3, 14)"),
            Some(state(2, 3, 14))
        );
        assert_eq!(DecisionState::parse_legacy("(2, 1, 3)"), None);
        assert_eq!(DecisionState::parse_legacy("(2, 1, 3, 25)"), None);
        assert_eq!(DecisionState::parse_legacy("(-1, 1, 3, 2)"), None);
        assert_eq!(DecisionState::parse_legacy("garbage"), None);
    }

    #[test]
    fn ranking_helpers() {
        let mut table = QTable::new();
        for i in 0..30u32 {
            table.insert(
                state(i, 0, 0),
                ActionValues::new([i as f64, 0.0, 0.0, 0.0]),
            );
        }
        let top = table.top_by_best(10);
        assert_eq!(top.len(), 10);
        assert_eq!(top[0].0.blind_epochs, 29);
        assert_eq!(top[9].0.blind_epochs, 20);

        let tail = table.tail_by_blind(20);
        assert_eq!(tail.len(), 20);
        assert_eq!(tail[0].0.blind_epochs, 10);
        assert_eq!(tail[19].0.blind_epochs, 29);
    }
}
