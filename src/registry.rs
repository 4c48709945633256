// src/registry.rs
//
// Target registry: tracked access points and the clients seen under them.
//
// The registry is a plain data store. Sharing and locking are handled by
// `SharedRegistry`: every mutation of AP/client state happens while holding
// its single exclusive lock, so readers that take the same lock always see a
// consistent multi-field snapshot (including a score that reflects the most
// recent sighting).

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

use crate::config::RegistryConfig;
use crate::scorer::recalculate_score;
use crate::types::{
    normalize_mac, secs_between, ReconProfile, TimestampMs, DEFAULT_SIGNAL_DBM, UNKNOWN_VENDOR,
};

/// A device seen talking to (or probing for) an AP.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Client {
    pub attempts: u32,
    pub last_attempt: TimestampMs,
    /// Zero means "never captured".
    pub last_success: TimestampMs,
    pub last_seen: TimestampMs,
    /// Seconds from the last attempt to the capture that followed it.
    pub response_time_s: Option<f64>,
    pub score: f64,
    pub signal: i32,
    pub vendor: String,
}

impl Client {
    pub fn new(now: TimestampMs) -> Self {
        Self {
            attempts: 0,
            last_attempt: 0,
            last_success: 0,
            last_seen: now,
            response_time_s: None,
            score: 0.0,
            signal: DEFAULT_SIGNAL_DBM,
            vendor: UNKNOWN_VENDOR.to_string(),
        }
    }
}

impl Default for Client {
    fn default() -> Self {
        Client::new(0)
    }
}

/// A tracked access point. Owns its clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccessPoint {
    pub ssid: Option<String>,
    pub channel: Option<u8>,
    pub last_seen: TimestampMs,
    pub clients: BTreeMap<String, Client>,
    pub attempts: u32,
    pub handshakes: u32,
    /// Handshake count at the previous learning pass (reward delta base).
    pub prev_handshakes: u32,
    /// Post-capture quiet period ends at this timestamp.
    pub cooldown_until: TimestampMs,
    /// Operating profile currently assigned to this AP.
    pub recon: ReconProfile,
}

impl AccessPoint {
    pub fn new(now: TimestampMs, recon: ReconProfile) -> Self {
        Self {
            ssid: None,
            channel: None,
            last_seen: now,
            clients: BTreeMap::new(),
            attempts: 0,
            handshakes: 0,
            prev_handshakes: 0,
            cooldown_until: 0,
            recon,
        }
    }

    pub fn in_cooldown(&self, now: TimestampMs) -> bool {
        now < self.cooldown_until
    }
}

impl Default for AccessPoint {
    fn default() -> Self {
        AccessPoint::new(0, ReconProfile::default())
    }
}

/// Counters committed by one attack attempt, copied out of the lock.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AttemptSnapshot {
    pub attempts: u32,
    pub last_success: TimestampMs,
    pub score: f64,
    pub channel: Option<u8>,
}

/// Result of an expiry sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub aps_removed: usize,
    pub clients_removed: usize,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Registry {
    aps: BTreeMap<String, AccessPoint>,
    /// Profile given to newly discovered APs (the current global profile).
    default_recon: ReconProfile,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a registry from a persisted AP map. AP and client keys are
    /// re-normalised.
    pub fn from_aps(aps: BTreeMap<String, AccessPoint>) -> Self {
        Self {
            aps: aps
                .into_iter()
                .map(|(mac, mut ap)| {
                    ap.clients = std::mem::take(&mut ap.clients)
                        .into_iter()
                        .map(|(client_mac, c)| (normalize_mac(&client_mac), c))
                        .collect();
                    (normalize_mac(&mac), ap)
                })
                .collect(),
            default_recon: ReconProfile::default(),
        }
    }

    pub fn aps(&self) -> &BTreeMap<String, AccessPoint> {
        &self.aps
    }

    pub fn aps_mut(&mut self) -> impl Iterator<Item = (&String, &mut AccessPoint)> {
        self.aps.iter_mut()
    }

    pub fn ap(&self, mac: &str) -> Option<&AccessPoint> {
        self.aps.get(&normalize_mac(mac))
    }

    pub fn client(&self, ap_mac: &str, client_mac: &str) -> Option<&Client> {
        self.ap(ap_mac)?.clients.get(&normalize_mac(client_mac))
    }

    pub fn ap_count(&self) -> usize {
        self.aps.len()
    }

    pub fn client_count(&self) -> usize {
        self.aps.values().map(|ap| ap.clients.len()).sum()
    }

    pub fn default_recon(&self) -> ReconProfile {
        self.default_recon
    }

    pub fn set_default_recon(&mut self, recon: ReconProfile) {
        self.default_recon = recon;
    }

    /// The AP with the most recent sighting, if any.
    pub fn most_recent_ap(&self) -> Option<&AccessPoint> {
        self.aps.values().max_by_key(|ap| ap.last_seen)
    }

    /// Record a sighting of an AP. Returns true if it was newly created.
    ///
    /// A missing channel or empty name never erases a known one.
    pub fn upsert_ap(
        &mut self,
        mac: &str,
        channel: Option<u8>,
        ssid: Option<&str>,
        now: TimestampMs,
    ) -> bool {
        let mac = normalize_mac(mac);
        let default_recon = self.default_recon;
        let mut created = false;
        let ap = self.aps.entry(mac).or_insert_with(|| {
            created = true;
            AccessPoint::new(now, default_recon)
        });
        ap.last_seen = now;
        if channel.is_some() {
            ap.channel = channel;
        }
        if let Some(name) = ssid.filter(|s| !s.is_empty()) {
            ap.ssid = Some(name.to_string());
        }
        created
    }

    /// Record a sighting of a client under an AP (creating either as needed)
    /// and refresh its score. Returns true if the client was newly created.
    ///
    /// The first known vendor sticks: a later `"unknown"` never overwrites it.
    pub fn upsert_client(
        &mut self,
        ap_mac: &str,
        client_mac: &str,
        signal: i32,
        vendor: &str,
        now: TimestampMs,
    ) -> bool {
        self.upsert_ap(ap_mac, None, None, now);
        let ap_mac = normalize_mac(ap_mac);
        let Some(ap) = self.aps.get_mut(&ap_mac) else {
            return false;
        };

        let mut created = false;
        let client = ap
            .clients
            .entry(normalize_mac(client_mac))
            .or_insert_with(|| {
                created = true;
                Client::new(now)
            });
        client.last_seen = now;
        client.signal = signal;
        if !vendor.is_empty() && vendor != UNKNOWN_VENDOR {
            client.vendor = vendor.to_string();
        }
        recalculate_score(client, now);
        created
    }

    /// Drop APs and clients whose last sighting is older than their window.
    ///
    /// The two windows are independent: a surviving AP may lose clients.
    pub fn sweep_expired(&mut self, now: TimestampMs, cfg: &RegistryConfig) -> SweepStats {
        let mut stats = SweepStats::default();

        let before = self.aps.len();
        self.aps
            .retain(|_, ap| secs_between(ap.last_seen, now) <= cfg.ap_expiry_s);
        stats.aps_removed = before - self.aps.len();

        for ap in self.aps.values_mut() {
            let before = ap.clients.len();
            ap.clients
                .retain(|_, c| secs_between(c.last_seen, now) <= cfg.client_expiry_s);
            stats.clients_removed += before - ap.clients.len();
        }

        stats
    }

    /// Commit one attack attempt against a tracked client.
    ///
    /// Returns None when either side is no longer tracked (e.g. expired
    /// concurrently).
    pub fn record_attempt(
        &mut self,
        ap_mac: &str,
        client_mac: &str,
        now: TimestampMs,
    ) -> Option<AttemptSnapshot> {
        let ap = self.aps.get_mut(&normalize_mac(ap_mac))?;
        let client = ap.clients.get_mut(&normalize_mac(client_mac))?;
        ap.attempts += 1;
        client.attempts += 1;
        client.last_attempt = now;
        Some(AttemptSnapshot {
            attempts: client.attempts,
            last_success: client.last_success,
            score: client.score,
            channel: ap.channel,
        })
    }

    /// Book a captured handshake. Returns false for untracked targets.
    pub fn record_handshake(
        &mut self,
        ap_mac: &str,
        client_mac: &str,
        now: TimestampMs,
        cooldown_s: f64,
    ) -> bool {
        let Some(ap) = self.aps.get_mut(&normalize_mac(ap_mac)) else {
            return false;
        };
        let Some(client) = ap.clients.get_mut(&normalize_mac(client_mac)) else {
            return false;
        };
        client.last_success = now;
        client.response_time_s = Some(secs_between(client.last_attempt, now));
        ap.handshakes += 1;
        ap.cooldown_until = now + (cooldown_s * 1000.0) as TimestampMs;
        true
    }

    /// Every client score across the registry.
    pub fn all_scores(&self) -> Vec<f64> {
        self.aps
            .values()
            .flat_map(|ap| ap.clients.values().map(|c| c.score))
            .collect()
    }

    /// Dynamic score gate: the value at index `floor(percentile * n)` of the
    /// sorted scores, or `fallback` when no scores exist.
    pub fn score_threshold(&self, percentile: f64, fallback: f64) -> f64 {
        percentile_cutoff(self.all_scores(), percentile).unwrap_or(fallback)
    }
}

/// Value at index `floor(p * n)` of the ascending-sorted input.
pub fn percentile_cutoff(mut values: Vec<f64>, percentile: f64) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(|a, b| a.total_cmp(b));
    let idx = ((percentile.clamp(0.0, 1.0) * values.len() as f64).floor() as usize)
        .min(values.len() - 1);
    Some(values[idx])
}

/// Registry shared between the control thread and worker tasks.
pub type SharedRegistry = Arc<Mutex<Registry>>;

pub fn shared(registry: Registry) -> SharedRegistry {
    Arc::new(Mutex::new(registry))
}

/// Take the registry lock, recovering the data from a poisoned mutex.
///
/// A worker that panicked mid-update leaves at worst a partially bumped
/// counter behind; that is preferable to taking the host down.
pub fn lock_registry(registry: &SharedRegistry) -> MutexGuard<'_, Registry> {
    registry.lock().unwrap_or_else(|e| e.into_inner())
}
