// src/engine.rs
//
// duckyprobe engine context:
//  - owns the shared registry, the learner (and its Q-table), the worker
//    pool, the dispatcher and the on-disk store,
//  - handles the host's events: AP discovered, client discovered,
//    handshake captured, epoch tick,
//  - runs the per-epoch cycle: expiry sweep → learning pass → broadcast
//    sweep → channel hop → save → telemetry,
//  - exposes the status label and the diagnostic view.
//
// All methods run on the host's control thread. They drive agent calls
// through the pool's runtime and therefore must not be called from inside
// an async context.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tracing::{debug, error, info};

use crate::agent::{Agent, ApTarget, ClientTarget};
use crate::config::{Config, Whitelist};
use crate::dashboard::{render_text, DashboardView};
use crate::dispatcher::{AttackTarget, Dispatcher};
use crate::gate::should_attack;
use crate::logging::{EpochReport, EpochSink};
use crate::persistence::{encode_registry, SaveReport, Store};
use crate::pool::WorkerPool;
use crate::registry::{lock_registry, shared, SharedRegistry};
use crate::rl::QLearner;
use crate::types::{normalize_mac, now_ms, ReconProfile, TimestampMs, UNKNOWN_VENDOR};

/// Seed offsets so the learner, gate and dispatcher draw independent streams
/// from one configured seed.
const GATE_SEED_OFFSET: u64 = 0x9e37_79b9;
const DISPATCH_SEED_OFFSET: u64 = 0x7f4a_7c15;

pub struct Engine {
    cfg: Config,
    registry: SharedRegistry,
    whitelist: Arc<Whitelist>,
    learner: QLearner,
    agent: Arc<dyn Agent>,
    dispatcher: Arc<Dispatcher>,
    pool: WorkerPool,
    store: Store,
    sink: Box<dyn EpochSink>,
    gate_rng: ChaCha8Rng,
    session_handshakes: u64,
    epoch: u64,
}

impl Engine {
    /// Build the engine from configuration, restoring learned state from
    /// storage. Missing or unreadable files start empty.
    ///
    /// Fails only when the worker runtime cannot be created.
    pub fn load(cfg: Config, agent: Arc<dyn Agent>, sink: Box<dyn EpochSink>) -> Result<Self> {
        let store = Store::from_config(&cfg.persistence);
        store.ensure_data_dirs();
        let (mut registry, table) = store.load();

        let learner = QLearner::with_table(cfg.learning.clone(), table);
        registry.set_default_recon(learner.current());
        let registry = shared(registry);

        let whitelist = Arc::new(Whitelist::from_entries(&cfg.whitelist));
        let seed = cfg.learning.seed;
        let gate_rng = match seed {
            Some(s) => ChaCha8Rng::seed_from_u64(s.wrapping_add(GATE_SEED_OFFSET)),
            None => ChaCha8Rng::from_entropy(),
        };
        let dispatcher = Arc::new(Dispatcher::new(
            cfg.dispatch.clone(),
            Arc::clone(&registry),
            Arc::clone(&whitelist),
            Arc::clone(&agent),
            seed.map(|s| s.wrapping_add(DISPATCH_SEED_OFFSET)),
        ));
        let pool = WorkerPool::new(cfg.dispatch.max_workers)?;

        info!(
            version = cfg.version,
            whitelist = whitelist.len(),
            max_workers = pool.max_workers(),
            states = learner.table().len(),
            "duckyprobe engine loaded"
        );

        Ok(Self {
            cfg,
            registry,
            whitelist,
            learner,
            agent,
            dispatcher,
            pool,
            store,
            sink,
            gate_rng,
            session_handshakes: 0,
            epoch: 0,
        })
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    pub fn registry(&self) -> SharedRegistry {
        Arc::clone(&self.registry)
    }

    pub fn learner(&self) -> &QLearner {
        &self.learner
    }

    pub fn whitelist(&self) -> &Whitelist {
        &self.whitelist
    }

    pub fn session_handshakes(&self) -> u64 {
        self.session_handshakes
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn in_flight(&self) -> usize {
        self.pool.in_flight()
    }

    /// Block until queued attack tasks have finished (or `timeout` passes).
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        self.pool.wait_idle(timeout)
    }

    // ------------------------------------------------------------------
    // Events
    // ------------------------------------------------------------------

    pub fn on_ap_discovered(&mut self, ap: &ApTarget) {
        self.on_ap_discovered_at(ap, now_ms());
    }

    pub fn on_ap_discovered_at(&mut self, ap: &ApTarget, now: TimestampMs) {
        let created = lock_registry(&self.registry).upsert_ap(
            &ap.mac,
            ap.channel,
            ap.ssid.as_deref(),
            now,
        );
        if created {
            info!(
                ap = %normalize_mac(&ap.mac),
                ssid = ap.ssid.as_deref().unwrap_or("Hidden"),
                channel = ?ap.channel,
                "new AP"
            );
        }
    }

    /// Record a client sighting and, when the gate allows it, submit
    /// `attack_copies` attack tasks. Returns the number submitted.
    pub fn on_client_discovered(&mut self, ap: &ApTarget, client: &ClientTarget) -> usize {
        self.on_client_discovered_at(ap, client, now_ms())
    }

    pub fn on_client_discovered_at(
        &mut self,
        ap: &ApTarget,
        client: &ClientTarget,
        now: TimestampMs,
    ) -> usize {
        let decision = {
            let mut reg = lock_registry(&self.registry);
            reg.upsert_ap(&ap.mac, ap.channel, ap.ssid.as_deref(), now);
            let vendor = if client.vendor.is_empty() {
                UNKNOWN_VENDOR
            } else {
                client.vendor.as_str()
            };
            reg.upsert_client(&ap.mac, &client.mac, client.signal, vendor, now);
            should_attack(
                &reg,
                &self.whitelist,
                &self.cfg.gate,
                &ap.mac,
                &client.mac,
                now,
                &mut self.gate_rng,
            )
        };

        debug!(
            ap = %ap.mac,
            client = %client.mac,
            attack = decision.attack,
            rule = decision.rule.as_str(),
            "gate decision"
        );
        if !decision.attack {
            return 0;
        }

        // The copies race; the second acts as an immediate retry.
        let target = AttackTarget::new(ap.clone(), client.clone());
        let mut submitted = 0usize;
        for _ in 0..self.cfg.dispatch.attack_copies {
            if self.submit_attack(target.clone()) {
                submitted += 1;
            }
        }
        submitted
    }

    /// Book a captured handshake and submit one confirmatory attack
    /// (never against a whitelisted network).
    ///
    /// A capture without a client is booked against the broadcast address.
    /// Returns false (and changes nothing) for untracked targets.
    pub fn on_handshake(&mut self, ap: &ApTarget, client: Option<&ClientTarget>) -> bool {
        self.on_handshake_at(ap, client, now_ms())
    }

    pub fn on_handshake_at(
        &mut self,
        ap: &ApTarget,
        client: Option<&ClientTarget>,
        now: TimestampMs,
    ) -> bool {
        let client = client.cloned().unwrap_or_else(ClientTarget::broadcast);
        let (booked, whitelisted) = {
            let mut reg = lock_registry(&self.registry);
            let booked = reg.record_handshake(
                &ap.mac,
                &client.mac,
                now,
                self.cfg.registry.handshake_cooldown_s,
            );
            let stored_ssid = reg.ap(&ap.mac).and_then(|a| a.ssid.as_deref());
            let whitelisted = self.whitelist.contains(&ap.mac, ap.ssid.as_deref())
                || self.whitelist.contains(&ap.mac, stored_ssid);
            (booked, whitelisted)
        };
        if !booked {
            debug!(ap = %ap.mac, client = %client.mac, "handshake for untracked target ignored");
            return false;
        }

        self.session_handshakes += 1;
        info!(
            ap = %normalize_mac(&ap.mac),
            client = %normalize_mac(&client.mac),
            session = self.session_handshakes,
            "handshake captured"
        );
        if whitelisted {
            debug!(ap = %ap.mac, "whitelisted; no confirmatory attack");
        } else {
            self.submit_attack(AttackTarget::new(ap.clone(), client));
        }
        true
    }

    /// One epoch: sweep, learn, broadcast, hop channel, save, report.
    pub fn on_epoch(&mut self, blind: u32) -> EpochReport {
        self.on_epoch_at(blind, now_ms())
    }

    pub fn on_epoch_at(&mut self, blind: u32, now: TimestampMs) -> EpochReport {
        let (sweep, outcome) = {
            let mut reg = lock_registry(&self.registry);
            let sweep = reg.sweep_expired(now, &self.cfg.registry);
            let outcome = self
                .learner
                .learn(&mut reg, blind, self.session_handshakes, now);
            (sweep, outcome)
        };
        if sweep.aps_removed + sweep.clients_removed > 0 {
            info!(
                aps = sweep.aps_removed,
                clients = sweep.clients_removed,
                "expired stale targets"
            );
        }
        info!(
            epoch = self.epoch,
            blind,
            reward = outcome.global_reward,
            profile = %outcome.global_profile,
            explored = outcome.explored,
            states = outcome.states,
            "learning pass"
        );

        let broadcasts_sent = self
            .pool
            .block_on(self.dispatcher.broadcast_deauth(now))
            .unwrap_or(0);

        let channel = self.dispatcher.select_optimal_channel();
        match self.pool.block_on(self.agent.set_channel(channel)) {
            Some(Ok(())) => info!(channel, "switched to optimal channel"),
            Some(Err(err)) => error!(channel, "channel switch failed: {err}"),
            None => debug!(channel, "pool shut down; channel switch skipped"),
        }

        let saved = self.save().is_ok();

        let mut report = EpochReport::from_outcome(self.epoch, now, blind, &outcome);
        report.session_handshakes = self.session_handshakes;
        report.aps_expired = sweep.aps_removed;
        report.clients_expired = sweep.clients_removed;
        report.channel = channel;
        report.broadcasts_sent = broadcasts_sent;
        report.saved = saved;
        self.sink.log_epoch(&report);

        self.epoch += 1;
        report
    }

    // ------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------

    fn submit_attack(&self, target: AttackTarget) -> bool {
        let dispatcher = Arc::clone(&self.dispatcher);
        let mut cancel = self.pool.cancel_token();
        self.pool.submit("attack", async move {
            let outcome = dispatcher.execute_attack(&target, &mut cancel).await;
            debug!(ap = %target.ap.mac, client = %target.client.mac, ?outcome, "attack finished");
        })
    }

    /// Queue a jittered follow-up deauth for a target.
    pub fn submit_retry(&self, target: AttackTarget, delay_s: f64) -> bool {
        let dispatcher = Arc::clone(&self.dispatcher);
        let mut cancel = self.pool.cancel_token();
        self.pool.submit("retry", async move {
            if !dispatcher.delayed_retry(&target, delay_s, &mut cancel).await {
                debug!(ap = %target.ap.mac, "retry cancelled");
            }
        })
    }

    // ------------------------------------------------------------------
    // Surfaces
    // ------------------------------------------------------------------

    /// Profile of the most recently seen AP, else the global profile.
    pub fn current_profile(&self) -> ReconProfile {
        lock_registry(&self.registry)
            .most_recent_ap()
            .map(|ap| ap.recon)
            .unwrap_or_else(|| self.learner.current())
    }

    /// Short status label for the host's display.
    pub fn status_label(&self) -> &'static str {
        self.current_profile().label()
    }

    pub fn dashboard(&self) -> DashboardView {
        let status = self.learner.current().label();
        let reg = lock_registry(&self.registry);
        DashboardView::build(
            status,
            self.session_handshakes,
            &reg,
            self.learner.table(),
            self.learner.config(),
        )
    }

    pub fn render_dashboard(&self) -> String {
        render_text(&self.dashboard())
    }

    // ------------------------------------------------------------------
    // Storage and teardown
    // ------------------------------------------------------------------

    /// Write registry and Q-table to disk. Never fails the caller.
    pub fn save(&self) -> SaveReport {
        let doc = encode_registry(&lock_registry(&self.registry));
        match doc {
            Ok(doc) => self.store.save(&doc, self.learner.table()),
            Err(err) => {
                error!("failed to encode registry: {err:#}");
                SaveReport {
                    registry_ok: false,
                    qtable_ok: self.store.save_qtable(self.learner.table()),
                }
            }
        }
    }

    /// Cancel in-flight tasks (bounded wait), then flush state to disk.
    pub fn shutdown(mut self) -> SaveReport {
        let grace = Duration::from_millis(self.cfg.dispatch.shutdown_grace_ms);
        let abandoned = self.pool.shutdown(grace);
        let report = self.save();
        info!(
            abandoned,
            saved = report.is_ok(),
            session_handshakes = self.session_handshakes,
            "duckyprobe engine unloaded"
        );
        report
    }
}
