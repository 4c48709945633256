// src/agent.rs
//
// The radio-facing side of the engine.
//
// The host agent owns the interface; the engine only asks it to hop channel,
// deauthenticate a client and send an association request. Every call is
// async and fallible. Failures are reported back as `AgentError` and the
// engine logs and swallows them.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;

use serde::Serialize;
use tracing::debug;

use crate::types::{BROADCAST_MAC, DEFAULT_SIGNAL_DBM, UNKNOWN_VENDOR};

pub type AgentResult<T> = Result<T, AgentError>;
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Access point as handed to the agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApTarget {
    pub mac: String,
    pub ssid: Option<String>,
    pub channel: Option<u8>,
}

impl ApTarget {
    pub fn new(mac: impl Into<String>, ssid: Option<String>, channel: Option<u8>) -> Self {
        Self {
            mac: mac.into(),
            ssid,
            channel,
        }
    }
}

/// Client station as handed to the agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClientTarget {
    pub mac: String,
    pub signal: i32,
    pub vendor: String,
}

impl ClientTarget {
    pub fn new(mac: impl Into<String>, signal: i32, vendor: impl Into<String>) -> Self {
        Self {
            mac: mac.into(),
            signal,
            vendor: vendor.into(),
        }
    }

    /// The all-stations pseudo client used for broadcast deauths.
    pub fn broadcast() -> Self {
        Self::new(BROADCAST_MAC, DEFAULT_SIGNAL_DBM, UNKNOWN_VENDOR)
    }

    pub fn is_broadcast(&self) -> bool {
        self.mac == BROADCAST_MAC
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AgentErrorKind {
    /// The interface is busy or briefly unavailable.
    Transient,
    /// The request was rejected (bad channel, unknown target, ...).
    Rejected,
    /// The agent is gone.
    Unavailable,
}

#[derive(Debug, Clone)]
pub struct AgentError {
    pub kind: AgentErrorKind,
    pub message: String,
}

impl AgentError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: AgentErrorKind::Transient,
            message: message.into(),
        }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            kind: AgentErrorKind::Rejected,
            message: message.into(),
        }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self {
            kind: AgentErrorKind::Unavailable,
            message: message.into(),
        }
    }

    pub fn reason_label(&self) -> &'static str {
        match self.kind {
            AgentErrorKind::Transient => "transient",
            AgentErrorKind::Rejected => "rejected",
            AgentErrorKind::Unavailable => "unavailable",
        }
    }
}

impl fmt::Display for AgentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "agent {}: {}", self.reason_label(), self.message)
    }
}

impl std::error::Error for AgentError {}

/// Capability surface of the host agent.
pub trait Agent: Send + Sync {
    fn set_channel(&self, channel: u8) -> BoxFuture<'_, AgentResult<()>>;

    fn deauth<'a>(
        &'a self,
        ap: &'a ApTarget,
        client: &'a ClientTarget,
        delay_s: f64,
    ) -> BoxFuture<'a, AgentResult<()>>;

    fn associate<'a>(&'a self, ap: &'a ApTarget, delay_s: f64) -> BoxFuture<'a, AgentResult<()>>;
}

/// One call observed by `SimAgent`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum AgentAction {
    SetChannel {
        channel: u8,
    },
    Deauth {
        ap: String,
        client: String,
        delay_s: f64,
    },
    Associate {
        ap: String,
        delay_s: f64,
    },
}

impl AgentAction {
    pub fn is_deauth(&self) -> bool {
        matches!(self, AgentAction::Deauth { .. })
    }

    pub fn is_associate(&self) -> bool {
        matches!(self, AgentAction::Associate { .. })
    }
}

/// In-process agent that records every call instead of touching a radio.
///
/// Used by the simulation harness and by tests. Calls can be made to fail
/// to exercise error paths.
#[derive(Debug, Default)]
pub struct SimAgent {
    actions: Mutex<Vec<AgentAction>>,
    fail_deauth: bool,
    fail_channel: bool,
}

impl SimAgent {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every deauth returns a transient error (still recorded).
    pub fn failing_deauth(mut self) -> Self {
        self.fail_deauth = true;
        self
    }

    /// Every channel hop is rejected (still recorded).
    pub fn failing_channel(mut self) -> Self {
        self.fail_channel = true;
        self
    }

    fn record(&self, action: AgentAction) {
        debug!(?action, "sim agent");
        self.actions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(action);
    }

    pub fn actions(&self) -> Vec<AgentAction> {
        self.actions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn take_actions(&self) -> Vec<AgentAction> {
        std::mem::take(&mut *self.actions.lock().unwrap_or_else(|e| e.into_inner()))
    }

    pub fn deauth_count(&self) -> usize {
        self.actions().iter().filter(|a| a.is_deauth()).count()
    }

    pub fn associate_count(&self) -> usize {
        self.actions().iter().filter(|a| a.is_associate()).count()
    }

    pub fn channels_set(&self) -> Vec<u8> {
        self.actions()
            .iter()
            .filter_map(|a| match a {
                AgentAction::SetChannel { channel } => Some(*channel),
                _ => None,
            })
            .collect()
    }
}

impl Agent for SimAgent {
    fn set_channel(&self, channel: u8) -> BoxFuture<'_, AgentResult<()>> {
        Box::pin(async move {
            self.record(AgentAction::SetChannel { channel });
            if self.fail_channel {
                return Err(AgentError::rejected(format!("channel {channel} refused")));
            }
            Ok(())
        })
    }

    fn deauth<'a>(
        &'a self,
        ap: &'a ApTarget,
        client: &'a ClientTarget,
        delay_s: f64,
    ) -> BoxFuture<'a, AgentResult<()>> {
        Box::pin(async move {
            self.record(AgentAction::Deauth {
                ap: ap.mac.clone(),
                client: client.mac.clone(),
                delay_s,
            });
            if self.fail_deauth {
                return Err(AgentError::transient("interface busy"));
            }
            Ok(())
        })
    }

    fn associate<'a>(&'a self, ap: &'a ApTarget, delay_s: f64) -> BoxFuture<'a, AgentResult<()>> {
        Box::pin(async move {
            self.record(AgentAction::Associate {
                ap: ap.mac.clone(),
                delay_s,
            });
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sim_agent_records_calls_in_order() {
        let agent = SimAgent::new();
        let ap = ApTarget::new("aa:bb:cc:dd:ee:ff", None, Some(6));
        let client = ClientTarget::new("11:22:33:44:55:66", -60, "Acme");
        agent.set_channel(6).await.unwrap();
        agent.deauth(&ap, &client, 0.05).await.unwrap();
        agent.associate(&ap, 0.025).await.unwrap();

        let actions = agent.actions();
        assert_eq!(actions.len(), 3);
        assert_eq!(actions[0], AgentAction::SetChannel { channel: 6 });
        assert!(actions[1].is_deauth());
        assert!(actions[2].is_associate());
        assert_eq!(agent.channels_set(), vec![6]);
    }

    #[tokio::test]
    async fn failures_are_reported_and_still_recorded() {
        let agent = SimAgent::new().failing_deauth().failing_channel();
        let ap = ApTarget::new("aa:bb:cc:dd:ee:ff", None, None);
        let err = agent
            .deauth(&ap, &ClientTarget::broadcast(), 0.1)
            .await
            .unwrap_err();
        assert_eq!(err.kind, AgentErrorKind::Transient);
        assert_eq!(err.to_string(), "agent transient: interface busy");
        let err = agent.set_channel(3).await.unwrap_err();
        assert_eq!(err.reason_label(), "rejected");
        assert_eq!(agent.take_actions().len(), 2);
        assert!(agent.actions().is_empty());
    }

    #[test]
    fn broadcast_client_uses_all_stations_address() {
        let c = ClientTarget::broadcast();
        assert!(c.is_broadcast());
        assert_eq!(c.mac, "ff:ff:ff:ff:ff:ff");
    }
}
