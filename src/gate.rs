// src/gate.rs
//
// Attack eligibility and backoff timing.
//
// `should_attack` is an ordered rule list; the first rule that matches
// decides. Soft rules return a coin flip instead of a hard "no" so that a
// backed-off target is still revisited occasionally.

use rand::Rng;

use crate::config::{DispatchConfig, GateConfig, Whitelist};
use crate::registry::Registry;
use crate::types::{secs_between, TimestampMs};

/// Which eligibility rule produced a decision (for logs and tests).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateRule {
    Whitelisted,
    UnknownAp,
    Cooldown,
    UnknownClient,
    RecentSuccess,
    AttemptCap,
    Default,
}

impl GateRule {
    pub fn as_str(&self) -> &'static str {
        match self {
            GateRule::Whitelisted => "whitelisted",
            GateRule::UnknownAp => "unknown_ap",
            GateRule::Cooldown => "cooldown",
            GateRule::UnknownClient => "unknown_client",
            GateRule::RecentSuccess => "recent_success",
            GateRule::AttemptCap => "attempt_cap",
            GateRule::Default => "default",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateDecision {
    pub attack: bool,
    pub rule: GateRule,
}

/// Decide whether `(ap_mac, client_mac)` should be attacked now.
///
/// The caller must hold the registry lock for the duration so the rule
/// inputs come from one snapshot.
pub fn should_attack<R: Rng + ?Sized>(
    registry: &Registry,
    whitelist: &Whitelist,
    cfg: &GateConfig,
    ap_mac: &str,
    client_mac: &str,
    now: TimestampMs,
    rng: &mut R,
) -> GateDecision {
    let ap = registry.ap(ap_mac);
    let ssid = ap.and_then(|a| a.ssid.as_deref());
    if whitelist.contains(ap_mac, ssid) {
        return GateDecision {
            attack: false,
            rule: GateRule::Whitelisted,
        };
    }

    let Some(ap) = ap else {
        return GateDecision {
            attack: true,
            rule: GateRule::UnknownAp,
        };
    };

    if ap.in_cooldown(now) {
        return GateDecision {
            attack: chance(rng, cfg.cooldown_attack_prob),
            rule: GateRule::Cooldown,
        };
    }

    let Some(client) = registry.client(ap_mac, client_mac) else {
        return GateDecision {
            attack: true,
            rule: GateRule::UnknownClient,
        };
    };

    if client.last_success > 0
        && secs_between(client.last_success, now) < cfg.recent_success_window_s
    {
        return GateDecision {
            attack: chance(rng, cfg.recent_success_attack_prob),
            rule: GateRule::RecentSuccess,
        };
    }

    if client.attempts >= cfg.attempt_cap {
        return GateDecision {
            attack: chance(rng, cfg.attempt_cap_attack_prob),
            rule: GateRule::AttemptCap,
        };
    }

    GateDecision {
        attack: true,
        rule: GateRule::Default,
    }
}

/// Bernoulli draw that tolerates out-of-range probabilities.
pub fn chance<R: Rng + ?Sized>(rng: &mut R, p: f64) -> bool {
    if p.is_nan() {
        return false;
    }
    rng.gen_bool(p.clamp(0.0, 1.0))
}

/// Per-attack delay handed to the agent (seconds).
///
/// `max(min_delay, base * decay^min(attempts, cap))`, halved when the
/// client produced a capture within the speed-up window.
pub fn calculate_delay(
    cfg: &DispatchConfig,
    attempts: u32,
    last_success: TimestampMs,
    now: TimestampMs,
) -> f64 {
    let exponent = attempts.min(cfg.delay_attempt_cap) as i32;
    let mut delay = (cfg.base_attack_delay_s * cfg.delay_decay.powi(exponent))
        .max(cfg.min_attack_delay_s);
    if last_success > 0 && secs_between(last_success, now) < cfg.success_speedup_window_s {
        delay *= 0.5;
    }
    delay
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    const T0: TimestampMs = 1_700_000_000_000;
    const AP: &str = "aa:bb:cc:dd:ee:ff";
    const CL: &str = "11:22:33:44:55:66";

    fn decide(reg: &Registry, wl: &Whitelist, now: TimestampMs, rng: &mut ChaCha8Rng) -> GateDecision {
        should_attack(reg, wl, &GateConfig::default(), AP, CL, now, rng)
    }

    fn attack_rate(reg: &Registry, now: TimestampMs) -> f64 {
        let mut rng = ChaCha8Rng::seed_from_u64(11);
        let wl = Whitelist::default();
        let n = 20_000;
        let hits = (0..n).filter(|_| decide(reg, &wl, now, &mut rng).attack).count();
        hits as f64 / n as f64
    }

    #[test]
    fn whitelisted_name_blocks_regardless_of_history() {
        let mut reg = Registry::new();
        reg.upsert_ap(AP, Some(6), Some("Home"), T0);
        reg.upsert_client(AP, CL, -30, "x", T0);
        let wl = Whitelist::from_entries(["home"]);
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        for _ in 0..100 {
            let d = decide(&reg, &wl, T0, &mut rng);
            assert!(!d.attack);
            assert_eq!(d.rule, GateRule::Whitelisted);
        }
    }

    #[test]
    fn whitelisted_mac_blocks_even_untracked_ap() {
        let reg = Registry::new();
        let wl = Whitelist::from_entries([AP]);
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        assert_eq!(decide(&reg, &wl, T0, &mut rng).rule, GateRule::Whitelisted);
    }

    #[test]
    fn unknown_targets_are_always_attacked() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let wl = Whitelist::default();
        let mut reg = Registry::new();
        let d = decide(&reg, &wl, T0, &mut rng);
        assert_eq!((d.attack, d.rule), (true, GateRule::UnknownAp));

        reg.upsert_ap(AP, None, None, T0);
        let d = decide(&reg, &wl, T0, &mut rng);
        assert_eq!((d.attack, d.rule), (true, GateRule::UnknownClient));
    }

    #[test]
    fn cooldown_is_a_soft_coin_flip() {
        let mut reg = Registry::new();
        reg.upsert_client(AP, CL, -60, "x", T0);
        reg.record_handshake(AP, CL, T0, 60.0);
        let rate = attack_rate(&reg, T0 + 1_000);
        assert!((rate - 0.5).abs() < 0.03, "rate {rate}");
    }

    #[test]
    fn recent_success_backs_off_to_30_percent() {
        let mut reg = Registry::new();
        reg.upsert_client(AP, CL, -60, "x", T0);
        reg.record_handshake(AP, CL, T0, 0.0);
        let rate = attack_rate(&reg, T0 + 120_000);
        assert!((rate - 0.3).abs() < 0.03, "rate {rate}");
        // Past the 300 s window the default rule applies again.
        assert_eq!(attack_rate(&reg, T0 + 301_000), 1.0);
    }

    #[test]
    fn attempt_cap_halves_attack_rate() {
        let mut reg = Registry::new();
        reg.upsert_client(AP, CL, -60, "x", T0);
        for _ in 0..50 {
            reg.record_attempt(AP, CL, T0);
        }
        let rate = attack_rate(&reg, T0);
        assert!((rate - 0.5).abs() < 0.03, "rate {rate}");
    }

    #[test]
    fn delay_decays_to_floor_and_halves_after_success() {
        let cfg = DispatchConfig::default();
        assert!((calculate_delay(&cfg, 0, 0, T0) - 0.05).abs() < 1e-12);
        assert!((calculate_delay(&cfg, 1, 0, T0) - 0.04).abs() < 1e-12);
        // 0.05 * 0.8^10 ≈ 0.00537 → floor.
        assert_eq!(calculate_delay(&cfg, 10, 0, T0), 0.02);
        assert_eq!(calculate_delay(&cfg, 500, 0, T0), 0.02);
        let recent = T0 - 60_000;
        assert!((calculate_delay(&cfg, 0, recent, T0) - 0.025).abs() < 1e-12);
        let stale = T0 - 2_000_000;
        assert!((calculate_delay(&cfg, 0, stale, T0) - 0.05).abs() < 1e-12);
    }
}
