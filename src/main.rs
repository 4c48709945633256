// src/main.rs
//
// Simulation harness around the duckyprobe library.
// Drives the engine with a synthetic radio environment and an in-process
// agent for N epochs. All of the real logic lives in the lib crate.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use duckyprobe::registry::lock_registry;
use duckyprobe::{
    render_text, ApTarget, ClientTarget, Config, Engine, EpochSink, FileSink, NoopSink,
    PluginOptions, ReconProfile, SimAgent,
};

/// Command-line arguments for the duckyprobe harness.
#[derive(Parser, Debug)]
#[command(name = "duckyprobe")]
struct Cli {
    /// Number of epochs to simulate.
    #[arg(long, default_value_t = 50)]
    epochs: u64,

    /// Access points in the synthetic environment.
    #[arg(long, default_value_t = 8)]
    aps: usize,

    /// Clients per access point.
    #[arg(long, default_value_t = 3)]
    clients_per_ap: usize,

    /// Seed for the environment and the engine.
    #[arg(long)]
    seed: Option<u64>,

    /// Directory for the registry and Q-table files.
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Host option block (JSON: memory_path, qtable_path, max_workers, whitelist).
    #[arg(long)]
    options: Option<PathBuf>,

    /// Optional JSONL path for per-epoch telemetry.
    #[arg(long)]
    log_jsonl: Option<PathBuf>,

    /// Print the diagnostic dashboard after the run.
    #[arg(long)]
    dashboard: bool,
}

/// Build the telemetry sink as a trait object so we can choose between
/// FileSink and NoopSink at runtime.
fn build_sink(log_jsonl: Option<&PathBuf>) -> Box<dyn EpochSink> {
    let Some(path) = log_jsonl else {
        return Box::new(NoopSink);
    };
    match FileSink::create(path) {
        Ok(s) => Box::new(s),
        Err(err) => {
            warn!(
                path = %path.display(),
                "failed to create telemetry log, falling back to NoopSink: {err}"
            );
            Box::new(NoopSink)
        }
    }
}

/// Defaults → env overrides → CLI data dir / seed → option file.
fn build_config(cli: &Cli) -> Result<Config> {
    let mut cfg = Config::from_env_or_default();

    if let Some(dir) = &cli.data_dir {
        cfg.persistence.memory_path = dir.join("duckyprobe.json");
        cfg.persistence.qtable_path = dir.join("duckyprobe_brain.json");
    }
    if cli.seed.is_some() {
        cfg.learning.seed = cli.seed;
    }
    if let Some(path) = &cli.options {
        let opts = PluginOptions::from_json_file(path)
            .with_context(|| format!("Invalid --options {}", path.display()))?;
        cfg.apply_options(&opts);
    }
    Ok(cfg)
}

/// A synthetic AP: fixed clients and a hidden profile under which captures
/// are much more likely.
struct SimAp {
    target: ApTarget,
    clients: Vec<ClientTarget>,
    affinity: ReconProfile,
}

struct SimWorld {
    aps: Vec<SimAp>,
    rng: ChaCha8Rng,
}

impl SimWorld {
    const SEEN_PROB: f64 = 0.7;
    const CLIENT_SEEN_PROB: f64 = 0.5;
    const CAPTURE_PROB_MATCH: f64 = 0.25;
    const CAPTURE_PROB_MISS: f64 = 0.05;

    fn new(aps: usize, clients_per_ap: usize, seed: u64) -> Self {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let aps = (0..aps)
            .map(|i| {
                let mac = format!("02:00:00:00:{:02x}:00", i);
                let channel = rng.gen_range(1..=13u8);
                let clients = (0..clients_per_ap)
                    .map(|j| {
                        ClientTarget::new(
                            format!("12:00:00:00:{:02x}:{:02x}", i, j),
                            rng.gen_range(-85..=-45),
                            if j % 2 == 0 { "Acme" } else { "unknown" },
                        )
                    })
                    .collect();
                SimAp {
                    target: ApTarget::new(mac, Some(format!("net-{i}")), Some(channel)),
                    clients,
                    affinity: ReconProfile::ALL[rng.gen_range(0..ReconProfile::COUNT)],
                }
            })
            .collect();
        Self { aps, rng }
    }

    /// One epoch of discovery and capture events. Returns captures.
    fn step(&mut self, engine: &mut Engine) -> u64 {
        for ap in &self.aps {
            if !self.rng.gen_bool(Self::SEEN_PROB) {
                continue;
            }
            engine.on_ap_discovered(&ap.target);
            for client in &ap.clients {
                if self.rng.gen_bool(Self::CLIENT_SEEN_PROB) {
                    engine.on_client_discovered(&ap.target, client);
                }
            }
        }

        let registry = engine.registry();
        let mut captures = 0u64;
        for ap in &self.aps {
            if ap.clients.is_empty() {
                continue;
            }
            let recon = lock_registry(&registry).ap(&ap.target.mac).map(|a| a.recon);
            let Some(recon) = recon else {
                continue;
            };
            let p = if recon == ap.affinity {
                Self::CAPTURE_PROB_MATCH
            } else {
                Self::CAPTURE_PROB_MISS
            };
            if self.rng.gen_bool(p) {
                let client = &ap.clients[self.rng.gen_range(0..ap.clients.len())];
                if engine.on_handshake(&ap.target, Some(client)) {
                    captures += 1;
                }
            }
        }
        captures
    }
}

fn main() -> Result<()> {
    // 0) Logging (RUST_LOG overrides the default level).
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    // 1) CLI + config.
    let cli = Cli::parse();
    let cfg = build_config(&cli)?;

    // 2) Engine with a simulated agent.
    let agent = Arc::new(SimAgent::new());
    let sink = build_sink(cli.log_jsonl.as_ref());
    let mut engine = Engine::load(cfg, agent.clone(), sink)?;

    // 3) Run N epochs.
    let mut world = SimWorld::new(cli.aps, cli.clients_per_ap, cli.seed.unwrap_or(0));
    let mut blind = 0u32;
    for _ in 0..cli.epochs {
        let captures = world.step(&mut engine);
        engine.wait_idle(Duration::from_secs(1));
        blind = if captures == 0 { blind + 1 } else { 0 };
        let report = engine.on_epoch(blind);
        info!(
            epoch = report.epoch,
            captures,
            reward = report.reward,
            profile = %report.global_profile,
            channel = report.channel,
            "epoch done"
        );
    }

    info!(
        session_handshakes = engine.session_handshakes(),
        deauths = agent.deauth_count(),
        associations = agent.associate_count(),
        status = engine.status_label(),
        "simulation finished"
    );
    if cli.dashboard {
        println!("{}", render_text(&engine.dashboard()));
    }

    // 4) Flush and tear down.
    let saved = engine.shutdown();
    if !saved.is_ok() {
        warn!(?saved, "final save incomplete");
    }
    Ok(())
}
