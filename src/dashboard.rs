// src/dashboard.rs
//
// Read-only diagnostic view.
//
// `DashboardView` is a serialisable snapshot of the engine (status label,
// totals, hyperparameters, top of the Q-table and the recent learning
// curve). `render_text` turns it into a plain-text page; HTML rendering is
// left to the host. A section that cannot be rendered shows an inline error
// instead of failing the page.

use std::fmt::{self, Write};

use serde::Serialize;

use crate::config::LearningConfig;
use crate::registry::Registry;
use crate::rl::{ActionValues, DecisionState, QTable};
use crate::types::ReconProfile;

/// Rows shown in the Q-table summary.
pub const TOP_STATES: usize = 10;
/// States plotted in the learning curve.
pub const CURVE_STATES: usize = 20;
/// Height of the learning curve in rows.
pub const GRAPH_HEIGHT: usize = 10;
/// Smallest y-range plotted, so a flat curve still renders.
const MIN_RANGE: f64 = 0.1;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QRow {
    pub state: DecisionState,
    pub values: [f64; ReconProfile::COUNT],
    pub best: ReconProfile,
}

impl QRow {
    fn new(state: DecisionState, values: &ActionValues) -> Self {
        Self {
            state,
            values: *values.as_array(),
            best: values.best(),
        }
    }
}

/// One point of the learning curve: a state's best value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CurvePoint {
    pub blind_epochs: u32,
    pub best_value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DashboardView {
    pub status: String,
    pub session_handshakes: u64,
    pub total_aps: usize,
    pub total_clients: usize,
    pub learning_rate: f64,
    pub discount_factor: f64,
    pub epsilon: f64,
    pub total_states: usize,
    /// Top states by best value, descending.
    pub top_states: Vec<QRow>,
    /// Last states ordered by blind-epoch count.
    pub curve: Vec<CurvePoint>,
}

impl DashboardView {
    pub fn build(
        status: &str,
        session_handshakes: u64,
        registry: &Registry,
        table: &QTable,
        cfg: &LearningConfig,
    ) -> Self {
        Self {
            status: status.to_string(),
            session_handshakes,
            total_aps: registry.ap_count(),
            total_clients: registry.client_count(),
            learning_rate: cfg.learning_rate,
            discount_factor: cfg.discount_factor,
            epsilon: cfg.epsilon,
            total_states: table.len(),
            top_states: table
                .top_by_best(TOP_STATES)
                .iter()
                .map(|(s, v)| QRow::new(*s, v))
                .collect(),
            curve: table
                .tail_by_blind(CURVE_STATES)
                .iter()
                .map(|(s, v)| CurvePoint {
                    blind_epochs: s.blind_epochs,
                    best_value: v.max_value(),
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DashboardError {
    NonFinite { index: usize, value: f64 },
    Format(fmt::Error),
}

impl fmt::Display for DashboardError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DashboardError::NonFinite { index, value } => {
                write!(f, "non-finite value {value} at point {index}")
            }
            DashboardError::Format(err) => write!(f, "format error: {err}"),
        }
    }
}

impl std::error::Error for DashboardError {}

impl From<fmt::Error> for DashboardError {
    fn from(err: fmt::Error) -> Self {
        DashboardError::Format(err)
    }
}

/// ASCII plot of `values`: one column per value, `GRAPH_HEIGHT` rows.
///
/// A cell is `#` when the value reaches the row, `.` on the row just below
/// the value's top and blank otherwise. Each row is prefixed with its floor
/// value; every fifth column gets a `^` tick under the axis.
pub fn render_sparkline(values: &[f64]) -> Result<String, DashboardError> {
    if let Some((index, value)) = values.iter().enumerate().find(|(_, v)| !v.is_finite()) {
        return Err(DashboardError::NonFinite {
            index,
            value: *value,
        });
    }
    let max_q = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let min_q = values.iter().copied().fold(f64::INFINITY, f64::min);
    let (max_q, min_q) = if values.is_empty() { (1.0, 0.0) } else { (max_q, min_q) };
    let range = (max_q - min_q).max(MIN_RANGE);
    let height = GRAPH_HEIGHT as f64;

    let mut out = String::new();
    writeln!(out, "Learning Progress (Last {} States):", values.len())?;
    writeln!(out, "Max Q: {max_q:.2} | Min Q: {min_q:.2}")?;
    writeln!(out)?;

    let levels: Vec<usize> = values
        .iter()
        .map(|v| (((v - min_q) / range) * height).floor().max(0.0) as usize)
        .collect();
    for row in (1..=GRAPH_HEIGHT).rev() {
        let floor = min_q + (row - 1) as f64 * (range / height);
        write!(out, "{floor:6.2} |")?;
        for level in &levels {
            let glyph = if *level >= row {
                '#'
            } else if *level == row - 1 {
                '.'
            } else {
                ' '
            };
            out.push(glyph);
        }
        out.push('\n');
    }
    writeln!(out, "       +{}", "-".repeat(values.len()))?;
    let ticks: String = (0..values.len())
        .map(|i| if i % 5 == 0 { '^' } else { ' ' })
        .collect();
    writeln!(out, "        {ticks}")?;
    write!(out, "       Blind Epochs")?;
    Ok(out)
}

fn render_qtable(view: &DashboardView, out: &mut String) -> Result<(), DashboardError> {
    if view.top_states.is_empty() {
        writeln!(out, "No Q-table data available yet")?;
        return Ok(());
    }
    write!(out, "{:>12}", "Blind")?;
    for p in ReconProfile::ALL {
        write!(out, " {:>9}", p.label())?;
    }
    out.push('\n');
    for row in &view.top_states {
        write!(out, "{:>12}", row.state.blind_epochs)?;
        for p in ReconProfile::ALL {
            let v = row.values[p.index()];
            let mark = if p == row.best { '*' } else { ' ' };
            write!(out, " {v:>8.2}{mark}")?;
        }
        out.push('\n');
    }
    writeln!(
        out,
        "Showing top {} of {} states",
        view.top_states.len(),
        view.total_states
    )?;
    Ok(())
}

/// Plain-text dashboard page.
pub fn render_text(view: &DashboardView) -> String {
    let mut out = String::new();
    out.push_str("== duckyprobe ==\n");
    out.push_str(&format!("Recon mode:          {}\n", view.status));
    out.push_str(&format!("Session handshakes:  {}\n", view.session_handshakes));
    out.push_str(&format!("Access points:       {}\n", view.total_aps));
    out.push_str(&format!("Clients:             {}\n", view.total_clients));
    out.push_str(&format!(
        "Learning:            alpha={:.2} gamma={:.2} epsilon={:.2}\n\n",
        view.learning_rate, view.discount_factor, view.epsilon
    ));

    out.push_str("-- Q-table --\n");
    let mut section = String::new();
    match render_qtable(view, &mut section) {
        Ok(()) => out.push_str(&section),
        Err(err) => out.push_str(&format!("Error generating Q-table: {err}\n")),
    }
    out.push('\n');

    out.push_str("-- Learning curve --\n");
    if view.curve.is_empty() {
        out.push_str("No learning data yet\n");
    } else {
        let values: Vec<f64> = view.curve.iter().map(|p| p.best_value).collect();
        match render_sparkline(&values) {
            Ok(graph) => {
                out.push_str(&graph);
                out.push('\n');
            }
            Err(err) => out.push_str(&format!("Error generating graph: {err}\n")),
        }
    }
    out
}
