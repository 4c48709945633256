// src/types.rs
//
// Common shared types for the duckyprobe engine.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Millisecond timestamp since Unix epoch.
pub type TimestampMs = i64;

/// Hardware address used for untargeted (broadcast) actions.
pub const BROADCAST_MAC: &str = "ff:ff:ff:ff:ff:ff";

/// Signal reading assumed when a sighting carries none (dBm).
pub const DEFAULT_SIGNAL_DBM: i32 = -100;

/// Vendor string used until a sighting reports a real one.
pub const UNKNOWN_VENDOR: &str = "unknown";

/// Current wall-clock time in milliseconds.
pub fn now_ms() -> TimestampMs {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as TimestampMs)
        .unwrap_or(0)
}

/// Elapsed seconds between two millisecond timestamps.
pub fn secs_between(earlier: TimestampMs, later: TimestampMs) -> f64 {
    (later - earlier) as f64 / 1000.0
}

/// Hour-of-day bucket (0-23, UTC) for a timestamp.
pub fn hour_bucket(ts: TimestampMs) -> u8 {
    let secs = ts.div_euclid(1000);
    (secs.rem_euclid(86_400) / 3_600) as u8
}

/// Canonical form of a hardware address: trimmed, lowercase.
pub fn normalize_mac(mac: &str) -> String {
    mac.trim().to_ascii_lowercase()
}

/// Operating profile ("recon" preset) chosen by the learner.
///
/// The engine treats these as opaque action identifiers. The numeric
/// triple is what the capture agent interprets; the label is what the
/// status widget shows. Declaration order is the canonical order used for
/// tie-breaking and table layout.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub enum ReconProfile {
    #[default]
    #[serde(rename = "LITE")]
    Lite,
    #[serde(rename = "STEALTH")]
    Stealth,
    #[serde(rename = "AGGRSV")]
    Aggressive,
    #[serde(rename = "GREED")]
    Greed,
}

impl ReconProfile {
    /// All profiles in canonical order.
    pub const ALL: [ReconProfile; 4] = [
        ReconProfile::Lite,
        ReconProfile::Stealth,
        ReconProfile::Aggressive,
        ReconProfile::Greed,
    ];

    /// Number of profiles (size of the action space).
    pub const COUNT: usize = 4;

    /// Position in canonical order (0-3).
    pub fn index(self) -> usize {
        match self {
            ReconProfile::Lite => 0,
            ReconProfile::Stealth => 1,
            ReconProfile::Aggressive => 2,
            ReconProfile::Greed => 3,
        }
    }

    pub fn from_index(idx: usize) -> Option<ReconProfile> {
        Self::ALL.get(idx).copied()
    }

    /// Parameter triple handed to the capture agent.
    pub fn params(self) -> (u32, u32, u32) {
        match self {
            ReconProfile::Lite => (10, 5, 20),
            ReconProfile::Stealth => (20, 10, 30),
            ReconProfile::Aggressive => (30, 20, 40),
            ReconProfile::Greed => (15, 5, 25),
        }
    }

    pub fn from_params(params: (u32, u32, u32)) -> Option<ReconProfile> {
        Self::ALL.iter().copied().find(|p| p.params() == params)
    }

    /// Short label for the status widget.
    pub fn label(self) -> &'static str {
        match self {
            ReconProfile::Lite => "LITE",
            ReconProfile::Stealth => "STEALTH",
            ReconProfile::Aggressive => "AGGRSV",
            ReconProfile::Greed => "GREED",
        }
    }

    /// Parse either a label (`"GREED"`) or a parameter tuple (`"(15, 5, 25)"`).
    pub fn parse(s: &str) -> Option<ReconProfile> {
        let trimmed = s.trim();
        if let Some(p) = Self::ALL
            .iter()
            .copied()
            .find(|p| p.label().eq_ignore_ascii_case(trimmed))
        {
            return Some(p);
        }
        let fields = parse_int_tuple(trimmed)?;
        match fields.as_slice() {
            [a, b, c] => Self::from_params((
                u32::try_from(*a).ok()?,
                u32::try_from(*b).ok()?,
                u32::try_from(*c).ok()?,
            )),
            _ => None,
        }
    }
}

impl fmt::Display for ReconProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Parse a parenthesised, comma-separated integer tuple such as `"(0, 3, 5, 14)"`.
///
/// Returns None on any malformed field.
pub fn parse_int_tuple(s: &str) -> Option<Vec<i64>> {
    let inner = s.trim().strip_prefix('(')?.strip_suffix(')')?;
    inner
        .split(',')
        .map(str::trim)
        .filter(|f| !f.is_empty())
        .map(|f| f.parse::<i64>().ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profile_labels_and_params_are_fixed() {
        assert_eq!(ReconProfile::Lite.params(), (10, 5, 20));
        assert_eq!(ReconProfile::Stealth.params(), (20, 10, 30));
        assert_eq!(ReconProfile::Aggressive.params(), (30, 20, 40));
        assert_eq!(ReconProfile::Greed.params(), (15, 5, 25));
        assert_eq!(ReconProfile::Aggressive.label(), "AGGRSV");
        for (i, p) in ReconProfile::ALL.iter().enumerate() {
            assert_eq!(p.index(), i);
            assert_eq!(ReconProfile::from_index(i), Some(*p));
        }
    }

    #[test]
    fn profile_parse_accepts_labels_and_tuples() {
        assert_eq!(ReconProfile::parse("greed"), Some(ReconProfile::Greed));
        assert_eq!(ReconProfile::parse("(20, 10, 30)"), Some(ReconProfile::Stealth));
        assert_eq!(ReconProfile::parse("(1, 2, 3)"), None);
        assert_eq!(ReconProfile::parse("(10, 5)"), None);
        assert_eq!(ReconProfile::parse("nonsense"), None);
    }

    #[test]
    fn int_tuple_parser_rejects_garbage() {
        assert_eq!(parse_int_tuple("(0, 3, 5, 14)"), Some(vec![0, 3, 5, 14]));
        assert_eq!(parse_int_tuple("0, 3"), None);
        assert_eq!(parse_int_tuple("(a, 3)"), None);
    }

    #[test]
    fn hour_bucket_wraps_daily() {
        assert_eq!(hour_bucket(0), 0);
        assert_eq!(hour_bucket(3_600_000 * 5 + 10), 5);
        assert_eq!(hour_bucket(86_400_000 + 3_600_000 * 23), 23);
    }

    #[test]
    fn mac_normalisation_lowercases_and_trims() {
        assert_eq!(normalize_mac("  AA:BB:CC:DD:EE:FF "), "aa:bb:cc:dd:ee:ff");
    }
}
