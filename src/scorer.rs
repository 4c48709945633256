// src/scorer.rs
//
// Client priority scoring.
//
//   signal_factor   = max(0, (signal + 80) / 20)
//   activity_factor = 1 + 1 / (age_s + 60)
//   success_bonus   = 200 if the client ever yielded a capture
//   score           = max(0, 100 * signal_factor + success_bonus
//                            - attempts * activity_factor)
//
// The score is non-decreasing in signal, non-increasing in attempts, and
// never negative.

use crate::registry::Client;
use crate::types::{secs_between, TimestampMs};

/// Bonus for a client that has produced a capture before.
pub const SUCCESS_BONUS: f64 = 200.0;

/// Signal at which the signal factor reaches zero (dBm).
const SIGNAL_FLOOR_DBM: f64 = -80.0;
/// Width of the signal band mapped to [0, 1].
const SIGNAL_SPAN_DB: f64 = 20.0;
/// Age offset in the activity factor; keeps the factor in (1, 1 + 1/60].
const ACTIVITY_AGE_OFFSET_S: f64 = 60.0;

/// Signal quality normalised to roughly [0, 1] for -80..-60 dBm; clamped below.
pub fn signal_factor(signal_dbm: i32) -> f64 {
    ((signal_dbm as f64 - SIGNAL_FLOOR_DBM) / SIGNAL_SPAN_DB).max(0.0)
}

/// Per-attempt penalty multiplier; decays toward 1 as the sighting ages.
pub fn activity_factor(age_s: f64) -> f64 {
    1.0 + 1.0 / (age_s.max(0.0) + ACTIVITY_AGE_OFFSET_S)
}

/// Compute a client's score at `now` without mutating it.
pub fn score_client(client: &Client, now: TimestampMs) -> f64 {
    let age_s = secs_between(client.last_seen, now);
    let bonus = if client.last_success > 0 {
        SUCCESS_BONUS
    } else {
        0.0
    };
    let raw = signal_factor(client.signal) * 100.0 + bonus
        - client.attempts as f64 * activity_factor(age_s);
    raw.max(0.0)
}

/// Recompute and store a client's score.
pub fn recalculate_score(client: &mut Client, now: TimestampMs) {
    client.score = score_client(client, now);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(signal: i32, attempts: u32, last_success: TimestampMs) -> Client {
        Client {
            signal,
            attempts,
            last_success,
            last_seen: 1_000_000,
            ..Client::new(1_000_000)
        }
    }

    #[test]
    fn fresh_client_at_minus_70_scores_50() {
        let c = client(-70, 0, 0);
        assert!((score_client(&c, 1_000_000) - 50.0).abs() < 1e-9);
        assert!((signal_factor(-70) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn weak_signal_clamps_to_zero() {
        assert_eq!(signal_factor(-100), 0.0);
        let c = client(-95, 30, 0);
        assert_eq!(score_client(&c, 1_000_000), 0.0);
    }

    #[test]
    fn score_is_monotone_in_signal_and_attempts() {
        let now = 1_030_000;
        let mut prev = f64::MIN;
        for signal in (-110..=-20).step_by(5) {
            let s = score_client(&client(signal, 7, 0), now);
            assert!(s >= prev, "signal {signal} lowered score");
            assert!(s >= 0.0);
            prev = s;
        }

        let mut prev = f64::MAX;
        for attempts in 0..120 {
            let s = score_client(&client(-62, attempts, 0), now);
            assert!(s <= prev, "attempts {attempts} raised score");
            prev = s;
        }
    }

    #[test]
    fn prior_success_adds_exact_bonus() {
        let now = 1_005_000;
        let base = score_client(&client(-65, 3, 0), now);
        let won = score_client(&client(-65, 3, 900_000), now);
        assert!((won - base - SUCCESS_BONUS).abs() < 1e-9);
    }

    #[test]
    fn activity_factor_decays_toward_one() {
        assert!((activity_factor(0.0) - (1.0 + 1.0 / 60.0)).abs() < 1e-12);
        assert!(activity_factor(10_000.0) < activity_factor(10.0));
        assert!(activity_factor(1e12) > 1.0);
    }

    #[test]
    fn recalculate_stores_score() {
        let mut c = client(-60, 0, 0);
        recalculate_score(&mut c, 1_000_000);
        assert!((c.score - 100.0).abs() < 1e-9);
    }
}
