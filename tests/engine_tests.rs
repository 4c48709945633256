// tests/engine_tests.rs
//
// Engine lifecycle against a simulated agent.
//
// These tests verify:
// 1. A new client that passes the gate is attacked twice (duplicate copies).
// 2. A capture is booked (cooldown, session counter) and triggers one
//    confirmatory attack; untracked captures are ignored.
// 3. An epoch learns, hops channel, saves both files and reports telemetry.
// 4. State survives shutdown and reload.
// 5. Whitelisted networks are never attacked, even when a capture event
//    carries no network name.
// 6. Failing agents never disturb the host.

use std::sync::Arc;
use std::time::Duration;

use duckyprobe::agent::{ApTarget, ClientTarget, SimAgent};
use duckyprobe::config::Config;
use duckyprobe::engine::Engine;
use duckyprobe::logging::{EpochReport, EpochSink, NoopSink};
use duckyprobe::registry::lock_registry;
use duckyprobe::types::{now_ms, ReconProfile};

const AP: &str = "aa:bb:cc:dd:ee:ff";
const CLIENT: &str = "11:22:33:44:55:66";

fn test_config(dir: &std::path::Path) -> Config {
    let mut cfg = Config::default();
    cfg.persistence.memory_path = dir.join("data").join("duckyprobe.json");
    cfg.persistence.qtable_path = dir.join("data").join("duckyprobe_brain.json");
    cfg.learning.seed = Some(17);
    cfg.dispatch.max_workers = 4;
    cfg
}

fn home_ap() -> ApTarget {
    ApTarget::new(AP, Some("Home".into()), Some(6))
}

fn client() -> ClientTarget {
    ClientTarget::new(CLIENT, -50, "Acme")
}

/// Sink that shares its reports with the test.
#[derive(Clone, Default)]
struct SharedSink(Arc<std::sync::Mutex<Vec<EpochReport>>>);

impl EpochSink for SharedSink {
    fn log_epoch(&mut self, report: &EpochReport) {
        self.0.lock().unwrap().push(report.clone());
    }
}

#[test]
fn discovery_capture_epoch_and_reload() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = test_config(dir.path());
    let agent = Arc::new(SimAgent::new());
    let sink = SharedSink::default();
    let mut engine = Engine::load(cfg.clone(), agent.clone(), Box::new(sink.clone())).unwrap();

    engine.on_ap_discovered(&home_ap());
    assert_eq!(engine.on_client_discovered(&home_ap(), &client()), 2);
    assert!(engine.wait_idle(Duration::from_secs(5)));
    assert_eq!(agent.deauth_count(), 2);
    {
        let registry = engine.registry();
        let reg = lock_registry(&registry);
        let ap = reg.ap(AP).unwrap();
        assert_eq!(ap.attempts, 2);
        assert_eq!(ap.clients[CLIENT].attempts, 2);
        assert_eq!(ap.clients[CLIENT].vendor, "Acme");
    }

    // Capture: booked, cooldown set, one confirmatory attack.
    assert!(engine.on_handshake(&home_ap(), Some(&client())));
    assert!(!engine.on_handshake(&home_ap(), Some(&ClientTarget::new("99:99:99:99:99:99", -40, ""))));
    assert_eq!(engine.session_handshakes(), 1);
    assert!(engine.wait_idle(Duration::from_secs(5)));
    assert_eq!(agent.deauth_count(), 3);
    {
        let registry = engine.registry();
        let reg = lock_registry(&registry);
        let ap = reg.ap(AP).unwrap();
        assert_eq!(ap.handshakes, 1);
        assert!(ap.in_cooldown(now_ms()));
        assert!(ap.clients[CLIENT].last_success > 0);
        assert!(ap.clients[CLIENT].response_time_s.is_some());
    }

    // Epoch: reward for the capture, channel hop to the only known channel.
    let report = engine.on_epoch(0);
    assert_eq!(report.epoch, 0);
    assert_eq!(report.reward, 10.0);
    assert_eq!(report.aps, 1);
    assert_eq!(report.clients, 1);
    assert_eq!(report.channel, 6);
    assert!(report.saved);
    // With a single AP the global and AP-local states coincide.
    assert_eq!(report.states, 1);
    assert_eq!(agent.channels_set().last(), Some(&6));
    assert!(cfg.persistence.memory_path.exists());
    assert!(cfg.persistence.qtable_path.exists());
    assert_eq!(sink.0.lock().unwrap().len(), 1);

    // Second epoch without captures: blind penalty only.
    let report = engine.on_epoch(2);
    assert_eq!(report.reward, -4.0);
    assert_eq!(report.epoch, 1);

    let label = engine.status_label();
    assert!(ReconProfile::ALL.iter().any(|p| p.label() == label));
    let text = engine.render_dashboard();
    assert!(text.contains("Session handshakes:  1"));
    assert!(text.contains("Access points:       1"));

    let states_before = engine.learner().table().len();
    assert!(engine.shutdown().is_ok());

    // Reload from disk.
    let agent = Arc::new(SimAgent::new());
    let engine = Engine::load(cfg, agent, Box::new(NoopSink)).unwrap();
    let registry = engine.registry();
    {
        let reg = lock_registry(&registry);
        let ap = reg.ap(AP).unwrap();
        assert_eq!(ap.handshakes, 1);
        assert_eq!(ap.attempts, 3);
        assert_eq!(ap.ssid.as_deref(), Some("Home"));
    }
    assert_eq!(engine.learner().table().len(), states_before);
    assert_eq!(engine.session_handshakes(), 0);
    engine.shutdown();
}

#[test]
fn whitelisted_network_is_left_alone() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = test_config(dir.path());
    cfg.whitelist = vec!["home".into()];
    let agent = Arc::new(SimAgent::new());
    let mut engine = Engine::load(cfg, agent.clone(), Box::new(NoopSink)).unwrap();

    engine.on_ap_discovered(&home_ap());
    assert_eq!(engine.on_client_discovered(&home_ap(), &client()), 0);
    assert!(engine.wait_idle(Duration::from_secs(5)));
    assert_eq!(agent.deauth_count(), 0);

    // Broadcast sweeps skip it as well.
    let mut cfg2 = engine.config().clone();
    cfg2.dispatch.broadcast_deauth_prob = 1.0;
    engine.shutdown();

    let agent = Arc::new(SimAgent::new());
    let mut engine = Engine::load(cfg2, agent.clone(), Box::new(NoopSink)).unwrap();
    engine.on_ap_discovered(&ApTarget::new("01:01:01:01:01:01", Some("Home".into()), Some(3)));
    let report = engine.on_epoch(0);
    assert_eq!(report.broadcasts_sent, 0);
    engine.shutdown();
}

#[test]
fn capture_on_whitelisted_network_triggers_no_attack() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = test_config(dir.path());
    cfg.whitelist = vec!["Home".into()];
    let agent = Arc::new(SimAgent::new());
    let mut engine = Engine::load(cfg, agent.clone(), Box::new(NoopSink)).unwrap();

    engine.on_ap_discovered(&home_ap());
    assert_eq!(engine.on_client_discovered(&home_ap(), &client()), 0);

    // The capture event carries no network name; the stored one applies.
    let unnamed = ApTarget::new(AP, None, Some(6));
    assert!(engine.on_handshake(&unnamed, Some(&client())));
    assert!(engine.wait_idle(Duration::from_secs(5)));
    assert_eq!(agent.deauth_count(), 0);
    assert!(agent.actions().is_empty());
    assert_eq!(engine.session_handshakes(), 1);
    {
        let registry = engine.registry();
        let reg = lock_registry(&registry);
        assert_eq!(reg.ap(AP).unwrap().attempts, 0);
        assert_eq!(reg.ap(AP).unwrap().handshakes, 1);
    }
    engine.shutdown();
}

#[test]
fn agent_failures_are_swallowed() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = test_config(dir.path());
    let agent = Arc::new(SimAgent::new().failing_deauth().failing_channel());
    let mut engine = Engine::load(cfg, agent.clone(), Box::new(NoopSink)).unwrap();

    engine.on_ap_discovered(&home_ap());
    assert_eq!(engine.on_client_discovered(&home_ap(), &client()), 2);
    assert!(engine.wait_idle(Duration::from_secs(5)));
    // Counters committed before the failure stay committed.
    {
        let registry = engine.registry();
        let reg = lock_registry(&registry);
        assert_eq!(reg.ap(AP).unwrap().attempts, 2);
    }
    let report = engine.on_epoch(1);
    assert!(report.saved);
    assert!(engine.shutdown().is_ok());
}

#[test]
fn broken_storage_starts_empty() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = test_config(dir.path());
    std::fs::create_dir_all(cfg.persistence.memory_path.parent().unwrap()).unwrap();
    std::fs::write(&cfg.persistence.memory_path, b"garbage").unwrap();
    std::fs::write(&cfg.persistence.qtable_path, b"[]").unwrap();

    let engine = Engine::load(cfg, Arc::new(SimAgent::new()), Box::new(NoopSink)).unwrap();
    assert_eq!(lock_registry(&engine.registry()).ap_count(), 0);
    assert!(engine.learner().table().is_empty());
    assert_eq!(engine.status_label(), "LITE");
    engine.shutdown();
}

#[test]
fn retry_and_shutdown_are_bounded() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = test_config(dir.path());
    cfg.dispatch.retry_jitter_s = (30.0, 31.0);
    cfg.dispatch.shutdown_grace_ms = 500;
    let agent = Arc::new(SimAgent::new());
    let engine = Engine::load(cfg, agent.clone(), Box::new(NoopSink)).unwrap();

    let target = duckyprobe::dispatcher::AttackTarget::new(home_ap(), client());
    assert!(engine.submit_retry(target, 0.05));
    assert_eq!(engine.in_flight(), 1);

    let started = std::time::Instant::now();
    assert!(engine.shutdown().is_ok());
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(agent.actions().is_empty());
}
