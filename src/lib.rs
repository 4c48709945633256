//! duckyprobe core library.
//!
//! An adaptive target-selection engine for a wireless capture agent: it
//! tracks access points and their clients, scores them, decides which to
//! act against and when, and learns (tabular Q-learning) which operating
//! profile pays off per epoch and per AP. The binary (`src/main.rs`) is a
//! thin simulation harness around these components.

pub mod agent;
pub mod config;
pub mod dashboard;
pub mod dispatcher;
pub mod engine;
pub mod gate;
pub mod logging;
pub mod persistence;
pub mod pool;
pub mod registry;
pub mod rl;
pub mod scorer;
pub mod types;

// --- Re-exports for ergonomic external use ---------------------------------

pub use agent::{Agent, AgentError, AgentErrorKind, ApTarget, ClientTarget, SimAgent};

pub use config::{Config, PluginOptions, Whitelist};

pub use dashboard::{render_text, DashboardView};

pub use dispatcher::{AttackOutcome, AttackTarget, Dispatcher};

pub use engine::Engine;

pub use gate::{calculate_delay, should_attack, GateDecision, GateRule};

pub use logging::{EpochReport, EpochSink, FileSink, MemorySink, NoopSink};

pub use persistence::{SaveReport, Store};

pub use pool::{CancelToken, WorkerPool};

pub use registry::{AccessPoint, Client, Registry, SharedRegistry};

pub use rl::{ActionValues, DecisionState, EpsilonGreedy, LearnOutcome, Policy, QLearner, QTable};

pub use scorer::score_client;

pub use types::{ReconProfile, TimestampMs};
