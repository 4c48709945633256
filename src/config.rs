// src/config.rs
//
// Central configuration for the duckyprobe engine.
// This is the single source of truth for every tunable the engine uses:
// storage paths, expiry windows, eligibility gates, dispatcher timing,
// learner hyperparameters and the whitelist.
//
// Every probabilistic branch constant lives here as a named field so
// research harnesses can override it without touching engine code.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::types::normalize_mac;

#[derive(Debug, Clone)]
pub struct Config {
    /// Human-readable config / release version.
    pub version: &'static str,
    /// Where learned state lives on disk.
    pub persistence: PersistenceConfig,
    /// Expiry windows and capture cooldown.
    pub registry: RegistryConfig,
    /// Eligibility gate probabilities (`should_attack`).
    pub gate: GateConfig,
    /// Attack timing, worker pool and opportunistic sweeps.
    pub dispatch: DispatchConfig,
    /// Q-learning hyperparameters and table maintenance.
    pub learning: LearningConfig,
    /// Raw whitelist entries (MACs or network names).
    pub whitelist: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct PersistenceConfig {
    /// Registry snapshot (APs + clients).
    pub memory_path: PathBuf,
    /// Q-table snapshot.
    pub qtable_path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// An AP not seen for this long is dropped.
    pub ap_expiry_s: f64,
    /// A client not seen for this long is dropped from its AP.
    pub client_expiry_s: f64,
    /// Quiet period applied to an AP after a capture.
    pub handshake_cooldown_s: f64,
}

#[derive(Debug, Clone)]
pub struct GateConfig {
    /// Attack probability while the AP is in its post-capture cooldown.
    pub cooldown_attack_prob: f64,
    /// A success younger than this counts as "recent".
    pub recent_success_window_s: f64,
    /// Attack probability for a recently satisfied client.
    pub recent_success_attack_prob: f64,
    /// Attempt count at which diminishing-returns backoff kicks in.
    pub attempt_cap: u32,
    /// Attack probability once the attempt cap is reached.
    pub attempt_cap_attack_prob: f64,
}

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Maximum number of attack tasks running at once.
    pub max_workers: usize,
    /// How many copies of an attack a new client discovery submits.
    pub attack_copies: usize,
    /// Drop submissions for a target that already has a task in flight.
    pub single_flight: bool,
    /// Floor for the computed per-attack delay (seconds).
    pub min_attack_delay_s: f64,
    /// Delay before any attempt decay (seconds).
    pub base_attack_delay_s: f64,
    /// Per-attempt multiplicative decay of the delay.
    pub delay_decay: f64,
    /// Attempts beyond this no longer shrink the delay.
    pub delay_attempt_cap: u32,
    /// Targets that succeeded within this window get half the delay.
    pub success_speedup_window_s: f64,
    /// Quantile of all client scores used as the dynamic score gate.
    pub score_percentile: f64,
    /// Score gate used before any score exists.
    pub fallback_score_threshold: f64,
    /// Probability of following a deauth with an association.
    pub fake_auth_prob: f64,
    /// Association delay as a fraction of the deauth delay.
    pub fake_auth_delay_factor: f64,
    /// Pause between deauth and association (ms).
    pub fake_auth_pause_ms: u64,
    /// Retry jitter window (seconds).
    pub retry_jitter_s: (f64, f64),
    /// Probability of an association after a retry deauth.
    pub retry_associate_prob: f64,
    /// Pause between retry deauth and association (ms).
    pub retry_pause_ms: u64,
    /// Association delay as a fraction of the retry deauth delay.
    pub retry_delay_factor: f64,
    /// Per-epoch probability of a broadcast deauth against an idle AP.
    pub broadcast_deauth_prob: f64,
    /// Only APs seen within this window are swept.
    pub broadcast_recent_window_s: f64,
    /// Delay handed to the agent for broadcast deauths.
    pub broadcast_delay_s: f64,
    /// Channels to choose from when no statistics exist yet.
    pub default_channels: Vec<u8>,
    /// Bounded wait for in-flight tasks at shutdown (ms).
    pub shutdown_grace_ms: u64,
}

#[derive(Debug, Clone)]
pub struct LearningConfig {
    /// Exploration rate ε.
    pub epsilon: f64,
    /// Learning rate α.
    pub learning_rate: f64,
    /// Discount factor γ.
    pub discount_factor: f64,
    /// Per-pass forgetting multiplier applied to every value of a visited state.
    pub decay: f64,
    /// Reward per newly captured handshake.
    pub reward_per_handshake: f64,
    /// Penalty per blind sub-interval.
    pub blind_penalty: f64,
    /// Priors are drawn from [-prior_range, prior_range].
    pub prior_range: f64,
    /// Table size that triggers pruning.
    pub max_states: usize,
    /// States evicted per pruning pass.
    pub prune_batch: usize,
    /// Seed for the learner RNG; None draws from OS entropy.
    pub seed: Option<u64>,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            memory_path: PathBuf::from("/etc/pwnagotchi/duckyprobe.json"),
            qtable_path: PathBuf::from("/etc/pwnagotchi/duckyprobe_brain.json"),
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            ap_expiry_s: 3_600.0 * 48.0,
            client_expiry_s: 3_600.0 * 24.0,
            handshake_cooldown_s: 60.0,
        }
    }
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            cooldown_attack_prob: 0.5,
            recent_success_window_s: 300.0,
            recent_success_attack_prob: 0.3,
            attempt_cap: 50,
            attempt_cap_attack_prob: 0.5,
        }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_workers: 50,
            attack_copies: 2,
            single_flight: false,
            min_attack_delay_s: 0.02,
            base_attack_delay_s: 0.05,
            delay_decay: 0.8,
            delay_attempt_cap: 10,
            success_speedup_window_s: 1_800.0,
            score_percentile: 0.6,
            fallback_score_threshold: 50.0,
            fake_auth_prob: 0.4,
            fake_auth_delay_factor: 0.5,
            fake_auth_pause_ms: 10,
            retry_jitter_s: (0.5, 1.5),
            retry_associate_prob: 0.7,
            retry_pause_ms: 100,
            retry_delay_factor: 0.3,
            broadcast_deauth_prob: 0.2,
            broadcast_recent_window_s: 300.0,
            broadcast_delay_s: 0.1,
            default_channels: (1..=14).collect(),
            shutdown_grace_ms: 2_000,
        }
    }
}

impl Default for LearningConfig {
    fn default() -> Self {
        Self {
            epsilon: 0.1,
            learning_rate: 0.7,
            discount_factor: 0.9,
            decay: 0.99,
            reward_per_handshake: 10.0,
            blind_penalty: 2.0,
            prior_range: 0.1,
            max_states: 1_000,
            prune_batch: 100,
            seed: None,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION"),
            persistence: PersistenceConfig::default(),
            registry: RegistryConfig::default(),
            gate: GateConfig::default(),
            dispatch: DispatchConfig::default(),
            learning: LearningConfig::default(),
            whitelist: Vec::new(),
        }
    }
}

/// Option block as the host hands it over (`main.*` in the host config).
///
/// Unknown keys are ignored so the host can carry its own settings in the
/// same document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginOptions {
    pub memory_path: Option<PathBuf>,
    pub qtable_path: Option<PathBuf>,
    pub max_workers: Option<usize>,
    pub whitelist: Vec<String>,
}

impl PluginOptions {
    /// Read an option block from a JSON file.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("Failed to read options file: {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse options file: {}", path.display()))
    }
}

impl Config {
    /// Apply a host option block on top of this config.
    ///
    /// A `max_workers` of zero is ignored (keeps the current bound).
    pub fn apply_options(&mut self, opts: &PluginOptions) {
        if let Some(path) = &opts.memory_path {
            self.persistence.memory_path = path.clone();
        }
        if let Some(path) = &opts.qtable_path {
            self.persistence.qtable_path = path.clone();
        }
        match opts.max_workers {
            Some(0) => warn!("max_workers=0 ignored; keeping {}", self.dispatch.max_workers),
            Some(n) => self.dispatch.max_workers = n,
            None => {}
        }
        if !opts.whitelist.is_empty() {
            self.whitelist = opts.whitelist.clone();
        }
    }

    /// Default config with `DUCKYPROBE_*` environment overrides applied.
    ///
    /// Recognised variables:
    ///   - DUCKYPROBE_MEMORY_PATH   (path)
    ///   - DUCKYPROBE_QTABLE_PATH   (path)
    ///   - DUCKYPROBE_MAX_WORKERS   (usize, > 0)
    ///   - DUCKYPROBE_WHITELIST     (comma-separated MACs / names)
    ///   - DUCKYPROBE_EPSILON       (f64, clamped to [0, 1])
    ///   - DUCKYPROBE_LEARNING_RATE (f64, clamped to [0, 1])
    ///   - DUCKYPROBE_DISCOUNT      (f64, clamped to [0, 1])
    ///   - DUCKYPROBE_SEED          (u64)
    ///
    /// Any variable that fails to parse is ignored with a warning.
    pub fn from_env_or_default() -> Self {
        use std::env;

        let mut cfg = Config::default();

        if let Ok(raw) = env::var("DUCKYPROBE_MEMORY_PATH") {
            cfg.persistence.memory_path = PathBuf::from(raw.trim());
            info!(path = %cfg.persistence.memory_path.display(), "DUCKYPROBE_MEMORY_PATH overrode default");
        }

        if let Ok(raw) = env::var("DUCKYPROBE_QTABLE_PATH") {
            cfg.persistence.qtable_path = PathBuf::from(raw.trim());
            info!(path = %cfg.persistence.qtable_path.display(), "DUCKYPROBE_QTABLE_PATH overrode default");
        }

        if let Ok(raw) = env::var("DUCKYPROBE_MAX_WORKERS") {
            match raw.trim().parse::<usize>() {
                Ok(v) if v > 0 => {
                    cfg.dispatch.max_workers = v;
                    info!("DUCKYPROBE_MAX_WORKERS = {v} (overrode default)");
                }
                _ => warn!(
                    "could not parse DUCKYPROBE_MAX_WORKERS = {:?} as positive integer; using default {}",
                    raw, cfg.dispatch.max_workers
                ),
            }
        }

        if let Ok(raw) = env::var("DUCKYPROBE_WHITELIST") {
            cfg.whitelist = raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
            info!("DUCKYPROBE_WHITELIST = {} entries", cfg.whitelist.len());
        }

        override_unit_f64("DUCKYPROBE_EPSILON", &mut cfg.learning.epsilon);
        override_unit_f64("DUCKYPROBE_LEARNING_RATE", &mut cfg.learning.learning_rate);
        override_unit_f64("DUCKYPROBE_DISCOUNT", &mut cfg.learning.discount_factor);

        if let Ok(raw) = env::var("DUCKYPROBE_SEED") {
            match raw.trim().parse::<u64>() {
                Ok(v) => {
                    cfg.learning.seed = Some(v);
                    info!("DUCKYPROBE_SEED = {v} (overrode default)");
                }
                Err(_) => warn!("could not parse DUCKYPROBE_SEED = {:?} as u64; ignoring", raw),
            }
        }

        cfg
    }
}

fn override_unit_f64(var: &str, slot: &mut f64) {
    let Ok(raw) = std::env::var(var) else {
        return;
    };
    match raw.trim().parse::<f64>() {
        Ok(v) if v.is_finite() => {
            *slot = v.clamp(0.0, 1.0);
            info!("{var} = {} (overrode default)", *slot);
        }
        _ => warn!("could not parse {var} = {:?} as f64; using default {}", raw, *slot),
    }
}

/// Precomputed whitelist: lowercase MACs and lowercase network names.
///
/// Entries containing `:` are MACs; everything else is a name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Whitelist {
    macs: HashSet<String>,
    names: HashSet<String>,
}

impl Whitelist {
    pub fn from_entries<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut wl = Whitelist::default();
        for entry in entries {
            let entry = entry.as_ref().trim().to_ascii_lowercase();
            if entry.is_empty() {
                continue;
            }
            if entry.contains(':') {
                wl.macs.insert(entry);
            } else {
                wl.names.insert(entry);
            }
        }
        wl
    }

    /// True when either the MAC or the network name is exempt.
    pub fn contains(&self, mac: &str, ssid: Option<&str>) -> bool {
        if self.macs.contains(&normalize_mac(mac)) {
            return true;
        }
        let name = ssid.map(|s| s.trim().to_lowercase()).unwrap_or_default();
        self.names.contains(&name)
    }

    pub fn len(&self) -> usize {
        self.macs.len() + self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
