// src/logging.rs
//
// Epoch telemetry sinks.
// - EpochSink: trait fed one report per learning epoch
// - NoopSink:  discards all reports
// - FileSink:  appends one JSON object per epoch (JSONL) for offline analysis
//
// Human-readable diagnostics go through `tracing`; this module is only the
// machine-readable per-epoch stream.

use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::Path;

use serde::Serialize;
use tracing::warn;

use crate::rl::LearnOutcome;
use crate::types::{ReconProfile, TimestampMs};

/// Everything one epoch did.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EpochReport {
    pub epoch: u64,
    pub ts_ms: TimestampMs,
    pub blind: u32,
    pub session_handshakes: u64,
    pub reward: f64,
    pub global_profile: ReconProfile,
    pub explored: bool,
    pub states: usize,
    pub pruned: usize,
    pub aps: usize,
    pub clients: usize,
    pub aps_expired: usize,
    pub clients_expired: usize,
    pub channel: u8,
    pub broadcasts_sent: usize,
    pub saved: bool,
}

impl EpochReport {
    /// Build a report from the learner outcome; the remaining fields are
    /// filled in by the caller as the epoch proceeds.
    pub fn from_outcome(epoch: u64, ts_ms: TimestampMs, blind: u32, outcome: &LearnOutcome) -> Self {
        Self {
            epoch,
            ts_ms,
            blind,
            session_handshakes: 0,
            reward: outcome.global_reward,
            global_profile: outcome.global_profile,
            explored: outcome.explored,
            states: outcome.states,
            pruned: outcome.pruned,
            aps: outcome.global_state.scope_size as usize,
            clients: outcome.global_state.client_count as usize,
            aps_expired: 0,
            clients_expired: 0,
            channel: 0,
            broadcasts_sent: 0,
            saved: false,
        }
    }
}

/// Abstract sink for per-epoch telemetry.
pub trait EpochSink: Send {
    fn log_epoch(&mut self, report: &EpochReport);
}

/// Sink that discards all reports.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl EpochSink for NoopSink {
    fn log_epoch(&mut self, _report: &EpochReport) {}
}

/// JSONL file sink.
///
/// Each epoch is written as a single JSON object on its own line.
pub struct FileSink {
    writer: BufWriter<File>,
}

impl FileSink {
    /// Create (truncate) a sink writing to `path`.
    pub fn create(path: &Path) -> io::Result<Self> {
        let file = File::create(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
        })
    }

    /// Open a sink that appends to an existing log.
    pub fn append(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
        })
    }
}

impl EpochSink for FileSink {
    fn log_epoch(&mut self, report: &EpochReport) {
        // A telemetry failure must never take the engine down.
        let result = serde_json::to_writer(&mut self.writer, report)
            .map_err(io::Error::from)
            .and_then(|()| self.writer.write_all(b"\n"))
            .and_then(|()| self.writer.flush());
        if let Err(err) = result {
            warn!(epoch = report.epoch, "failed to write epoch telemetry: {err}");
        }
    }
}

/// Sink that keeps reports in memory (harness summaries, tests).
#[derive(Debug, Default, Clone)]
pub struct MemorySink {
    pub reports: Vec<EpochReport>,
}

impl EpochSink for MemorySink {
    fn log_epoch(&mut self, report: &EpochReport) {
        self.reports.push(report.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rl::DecisionState;

    fn outcome() -> LearnOutcome {
        LearnOutcome {
            global_state: DecisionState::global(1, 3, 7, 12),
            global_reward: 8.0,
            global_profile: ReconProfile::Stealth,
            explored: false,
            ap_updates: 3,
            states: 4,
            pruned: 0,
        }
    }

    #[test]
    fn file_sink_writes_one_json_object_per_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("epochs.jsonl");
        let mut sink = FileSink::create(&path).unwrap();
        for epoch in 0..3 {
            let mut report = EpochReport::from_outcome(epoch, 1_000, 1, &outcome());
            report.channel = 6;
            sink.log_epoch(&report);
        }
        drop(sink);

        let raw = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = raw.lines().collect();
        assert_eq!(lines.len(), 3);
        let v: serde_json::Value = serde_json::from_str(lines[2]).unwrap();
        assert_eq!(v["epoch"], 2);
        assert_eq!(v["global_profile"], "STEALTH");
        assert_eq!(v["aps"], 3);
        assert_eq!(v["clients"], 7);
        assert_eq!(v["channel"], 6);
    }

    #[test]
    fn memory_sink_collects_reports() {
        let mut sink = MemorySink::default();
        sink.log_epoch(&EpochReport::from_outcome(0, 0, 0, &outcome()));
        NoopSink.log_epoch(&EpochReport::from_outcome(1, 0, 0, &outcome()));
        assert_eq!(sink.reports.len(), 1);
    }
}
