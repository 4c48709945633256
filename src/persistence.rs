// src/persistence.rs
//
// Durable storage for learned state.
//
// Two independent JSON documents:
// - registry: `{ "<ap mac>": { ...AccessPoint... } }`
// - q-table:  `{ "version": 1, "states": [ { "state": {...}, "values": { "LITE": q, ... } } ] }`
//
// Both are replaced atomically (temp file in the destination directory,
// write, flush, fsync, rename). Loading is lenient: a missing or broken file
// yields an empty structure, and individual Q-table records that fail to
// decode are dropped with a warning. The loader also understands the older
// q-table layout keyed by stringified tuples (`"(0, 3, 5, 14)"`).

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, info, warn};

use crate::config::PersistenceConfig;
use crate::registry::{AccessPoint, Registry};
use crate::rl::{ActionValues, DecisionState, QTable};
use crate::types::ReconProfile;

/// Current q-table document version.
pub const QTABLE_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct QTableDoc {
    version: u32,
    states: Vec<Value>,
}

#[derive(Debug, Serialize, Deserialize)]
struct StateRecord {
    state: DecisionState,
    values: BTreeMap<String, Value>,
}

// ============================================================================
// Atomic file write utilities
// ============================================================================

/// Write data to a file atomically (write to temp, then rename).
///
/// The temp file is created in the same directory to ensure rename works
/// (same filesystem). On failure the destination is left untouched and the
/// temp file is removed.
pub fn atomic_write(path: &Path, data: &[u8]) -> Result<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };

    let temp_name = format!(
        ".tmp_{}_{}",
        std::process::id(),
        path.file_name()
            .map(|s| s.to_string_lossy())
            .unwrap_or_default()
    );
    let temp_path = parent.join(&temp_name);

    let result = (|| -> Result<()> {
        let mut file = File::create(&temp_path)
            .with_context(|| format!("Failed to create temp file: {}", temp_path.display()))?;
        file.write_all(data)
            .with_context(|| format!("Failed to write temp file: {}", temp_path.display()))?;
        file.flush()
            .with_context(|| format!("Failed to flush temp file: {}", temp_path.display()))?;
        file.sync_all()
            .with_context(|| format!("Failed to sync temp file: {}", temp_path.display()))?;

        // Rename temp to final (atomic on POSIX)
        fs::rename(&temp_path, path).with_context(|| {
            format!(
                "Failed to rename {} to {}",
                temp_path.display(),
                path.display()
            )
        })
    })();

    if result.is_err() {
        let _ = fs::remove_file(&temp_path);
    }
    result
}

// ============================================================================
// Registry document
// ============================================================================

pub fn encode_registry(registry: &Registry) -> Result<Vec<u8>> {
    serde_json::to_vec_pretty(registry.aps()).context("Failed to encode registry")
}

pub fn decode_registry(raw: &[u8]) -> Result<Registry> {
    let aps: BTreeMap<String, AccessPoint> =
        serde_json::from_slice(raw).context("Failed to decode registry")?;
    Ok(Registry::from_aps(aps))
}

// ============================================================================
// Q-table document
// ============================================================================

pub fn encode_qtable(table: &QTable) -> Result<Vec<u8>> {
    let states = table
        .iter()
        .map(|(state, values)| {
            let values = values
                .iter()
                .map(|(p, v)| (p.label().to_string(), Value::from(v)))
                .collect();
            serde_json::to_value(StateRecord {
                state: *state,
                values,
            })
        })
        .collect::<serde_json::Result<Vec<Value>>>()
        .context("Failed to encode q-table record")?;
    let doc = QTableDoc {
        version: QTABLE_FORMAT_VERSION,
        states,
    };
    serde_json::to_vec_pretty(&doc).context("Failed to encode q-table")
}

/// Decode a q-table document, dropping records that do not parse.
///
/// Returns the table and the number of dropped states/actions.
pub fn decode_qtable(raw: &[u8]) -> Result<(QTable, usize)> {
    let value: Value = serde_json::from_slice(raw).context("Failed to parse q-table JSON")?;
    let mut table = QTable::new();
    let mut dropped = 0usize;

    match value {
        Value::Object(map) if map.contains_key("states") => {
            let doc: QTableDoc =
                serde_json::from_value(Value::Object(map)).context("Malformed q-table document")?;
            if doc.version != QTABLE_FORMAT_VERSION {
                warn!(version = doc.version, "unexpected q-table version; decoding anyway");
            }
            for record in doc.states {
                match serde_json::from_value::<StateRecord>(record) {
                    Ok(rec) => {
                        let (values, bad) = decode_action_values(&rec.values);
                        dropped += bad;
                        table.insert(rec.state, values);
                    }
                    Err(err) => {
                        warn!("dropping undecodable q-table record: {err}");
                        dropped += 1;
                    }
                }
            }
        }
        Value::Object(map) => {
            // Older layout: stringified tuple keys on both levels.
            for (key, actions) in map {
                let Some(state) = DecisionState::parse_legacy(&key) else {
                    warn!(key = %key, "dropping q-table state with unparsable key");
                    dropped += 1;
                    continue;
                };
                let Value::Object(actions) = actions else {
                    warn!(key = %key, "dropping q-table state whose actions are not an object");
                    dropped += 1;
                    continue;
                };
                let actions: BTreeMap<String, Value> = actions.into_iter().collect();
                let (values, bad) = decode_action_values(&actions);
                dropped += bad;
                table.insert(state, values);
            }
        }
        other => anyhow::bail!("q-table root must be an object, found {}", json_kind(&other)),
    }

    Ok((table, dropped))
}

/// Decode a `{profile key → value}` map into a full row. Unknown keys or
/// non-numeric values are dropped; profiles without a value start at 0.
fn decode_action_values(raw: &BTreeMap<String, Value>) -> (ActionValues, usize) {
    let mut values = ActionValues::default();
    let mut dropped = 0usize;
    for (key, v) in raw {
        match (ReconProfile::parse(key), v.as_f64()) {
            (Some(profile), Some(q)) if q.is_finite() => values.set(profile, q),
            _ => {
                warn!(action = %key, "dropping undecodable q-table action");
                dropped += 1;
            }
        }
    }
    (values, dropped)
}

fn json_kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ============================================================================
// Store
// ============================================================================

/// Which artifacts a save managed to write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SaveReport {
    pub registry_ok: bool,
    pub qtable_ok: bool,
}

impl SaveReport {
    pub fn is_ok(&self) -> bool {
        self.registry_ok && self.qtable_ok
    }
}

/// The two on-disk artifacts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Store {
    memory_path: PathBuf,
    qtable_path: PathBuf,
}

impl Store {
    pub fn new(memory_path: impl Into<PathBuf>, qtable_path: impl Into<PathBuf>) -> Self {
        Self {
            memory_path: memory_path.into(),
            qtable_path: qtable_path.into(),
        }
    }

    pub fn from_config(cfg: &PersistenceConfig) -> Self {
        Self::new(&cfg.memory_path, &cfg.qtable_path)
    }

    pub fn memory_path(&self) -> &Path {
        &self.memory_path
    }

    pub fn qtable_path(&self) -> &Path {
        &self.qtable_path
    }

    /// Create the directories holding both artifacts. Failures are logged.
    pub fn ensure_data_dirs(&self) {
        for path in [&self.memory_path, &self.qtable_path] {
            if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
                if let Err(err) = fs::create_dir_all(dir) {
                    error!(dir = %dir.display(), "failed to ensure data directory: {err}");
                }
            }
        }
    }

    /// Atomically replace the registry file with an encoded document.
    pub fn save_registry_doc(&self, registry_doc: &[u8]) -> bool {
        match atomic_write(&self.memory_path, registry_doc) {
            Ok(()) => true,
            Err(err) => {
                error!("failed to save registry: {err:#}");
                false
            }
        }
    }

    /// Atomically replace the q-table file.
    pub fn save_qtable(&self, table: &QTable) -> bool {
        match encode_qtable(table).and_then(|b| atomic_write(&self.qtable_path, &b)) {
            Ok(()) => true,
            Err(err) => {
                error!("failed to save q-table: {err:#}");
                false
            }
        }
    }

    /// Write both artifacts. Each write is independent; a failure of one
    /// never prevents the other and never propagates.
    pub fn save(&self, registry_doc: &[u8], table: &QTable) -> SaveReport {
        SaveReport {
            registry_ok: self.save_registry_doc(registry_doc),
            qtable_ok: self.save_qtable(table),
        }
    }

    /// Encode and write a registry plus table in one call.
    pub fn save_all(&self, registry: &Registry, table: &QTable) -> SaveReport {
        let registry_ok = match encode_registry(registry) {
            Ok(doc) => self.save_registry_doc(&doc),
            Err(err) => {
                error!("failed to encode registry: {err:#}");
                false
            }
        };
        SaveReport {
            registry_ok,
            qtable_ok: self.save_qtable(table),
        }
    }

    /// Load both artifacts. Missing files give empty structures; broken
    /// files are logged and replaced by empty structures.
    pub fn load(&self) -> (Registry, QTable) {
        let registry = match read_optional(&self.memory_path).and_then(|raw| {
            raw.map(|bytes| decode_registry(&bytes)).transpose()
        }) {
            Ok(Some(reg)) => {
                info!(aps = reg.ap_count(), "loaded registry");
                reg
            }
            Ok(None) => Registry::new(),
            Err(err) => {
                error!("failed to load registry, starting empty: {err:#}");
                Registry::new()
            }
        };

        let table = match read_optional(&self.qtable_path)
            .and_then(|raw| raw.map(|bytes| decode_qtable(&bytes)).transpose())
        {
            Ok(Some((table, dropped))) => {
                if dropped > 0 {
                    warn!(dropped, "q-table loaded with undecodable entries dropped");
                }
                info!(states = table.len(), "loaded q-table");
                table
            }
            Ok(None) => QTable::new(),
            Err(err) => {
                error!("failed to load q-table, starting empty: {err:#}");
                QTable::new()
            }
        };

        (registry, table)
    }
}

fn read_optional(path: &Path) -> Result<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).with_context(|| format!("Failed to read {}", path.display())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atomic_write_replaces_destination() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.json");
        atomic_write(&path, b"first").unwrap();
        atomic_write(&path, b"second").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"second");
        // No temp files left behind.
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn atomic_write_failure_keeps_previous_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.json");
        atomic_write(&path, b"keep me").unwrap();
        // Renaming a file over a non-empty directory fails.
        let blocked = dir.path().join("blocked");
        fs::create_dir(&blocked).unwrap();
        fs::write(blocked.join("child"), b"x").unwrap();
        assert!(atomic_write(&blocked, b"new").is_err());
        assert_eq!(fs::read(&path).unwrap(), b"keep me");
        assert!(fs::read_dir(dir.path())
            .unwrap()
            .all(|e| !e.unwrap().file_name().to_string_lossy().starts_with(".tmp_")));
    }

    #[test]
    fn legacy_layout_is_decoded() {
        let raw = br#"{
            "(0, 3, 5, 14)": {"(10, 5, 20)": 1.5, "(20, 10, 30)": -0.5, "(30, 20, 40)": 0.0, "(15, 5, 25)": 2.0},
            "(oops)": {"(10, 5, 20)": 1.0},
            "(1, 1, 0, 2)": {"(10, 5, 20)": 0.25, "(9, 9, 9)": 4.0}
        }"#;
        let (table, dropped) = decode_qtable(raw).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(dropped, 2);
        let s = DecisionState::parse_legacy("(0, 3, 5, 14)").unwrap();
        let row = table.get(&s).unwrap();
        assert_eq!(row.get(ReconProfile::Greed), 2.0);
        assert_eq!(row.get(ReconProfile::Stealth), -0.5);
        let s = DecisionState::parse_legacy("(1, 1, 0, 2)").unwrap();
        assert_eq!(table.get(&s).unwrap().get(ReconProfile::Lite), 0.25);
        assert_eq!(table.get(&s).unwrap().get(ReconProfile::Greed), 0.0);
    }

    #[test]
    fn structured_layout_drops_bad_records_only() {
        let raw = br#"{"version":1,"states":[
            {"state":{"blind_epochs":1,"scope_size":4,"client_count":2,"time_bucket":9},
             "values":{"LITE":0.1,"STEALTH":0.2,"AGGRSV":0.3,"GREED":"x"}},
            {"state":{"blind_epochs":"bad"},"values":{}}
        ]}"#;
        let (table, dropped) = decode_qtable(raw).unwrap();
        assert_eq!(table.len(), 1);
        assert_eq!(dropped, 2);
    }

    #[test]
    fn non_object_root_is_an_error() {
        assert!(decode_qtable(b"[1,2,3]").is_err());
        assert!(decode_qtable(b"not json").is_err());
    }
}
