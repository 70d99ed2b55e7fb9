//! Peer heartbeat arbitration.
//!
//! Each round asks every configured peer for its heartbeat. A peer that
//! answers with a well-formed document confirms there is no competing
//! owner; any other outcome leaves the answer unknown. The round raises the
//! split-brain flag when any peer is unknown. The flag stays raised until a
//! round in which every peer confirms.

mod client;
mod heartbeat;

pub use client::{heartbeat_timeout, HeartbeatClient, HttpHeartbeatClient, PeerError};
pub use heartbeat::{Heartbeat, HEARTBEAT_PATH, STATUS_ACTIVE, STATUS_STANDBY};

use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

use fleet_settings::Settings;

/// Role of this monitor instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorStatus {
    Active,
    Standby,
}

impl MonitorStatus {
    /// Status code carried in heartbeats.
    pub fn code(self) -> &'static str {
        match self {
            Self::Active => STATUS_ACTIVE,
            Self::Standby => STATUS_STANDBY,
        }
    }
}

impl std::fmt::Display for MonitorStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Standby => write!(f, "standby"),
        }
    }
}

/// What one peer told us this round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Well-formed heartbeat received.
    Confirmed(Heartbeat),
    /// Unreachable, timed out, refused, or unparsable.
    Unknown(String),
}

/// Per-peer result of one round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerStatus {
    pub peer: String,
    pub verdict: Verdict,
}

impl PeerStatus {
    pub fn reachable(&self) -> bool {
        matches!(self.verdict, Verdict::Confirmed(_))
    }

    /// The peer leaves the outcome uncertain.
    pub fn contributes_risk(&self) -> bool {
        !self.reachable()
    }

    pub fn heartbeat(&self) -> Option<&Heartbeat> {
        match &self.verdict {
            Verdict::Confirmed(hb) => Some(hb),
            Verdict::Unknown(_) => None,
        }
    }

    pub fn reports_active(&self) -> bool {
        self.heartbeat().is_some_and(Heartbeat::is_active)
    }
}

/// Outcome of one arbitration round.
#[derive(Debug, Clone)]
pub struct RoundReport {
    pub peers: Vec<PeerStatus>,
    pub split_brain: bool,
    pub status: MonitorStatus,
    /// This round moved the instance from standby to active.
    pub promoted: bool,
}

#[derive(Debug)]
struct ArbitrationState {
    status: MonitorStatus,
    split_brain: bool,
}

/// Heartbeat exchange with peer monitors.
pub struct PeerArbitrator {
    client: Arc<dyn HeartbeatClient>,
    peers: Vec<String>,
    enabled: bool,
    uuid: String,
    secret: String,
    log_heartbeat: bool,
    state: Mutex<ArbitrationState>,
}

impl std::fmt::Debug for PeerArbitrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerArbitrator")
            .field("peers", &self.peers)
            .field("enabled", &self.enabled)
            .field("uuid", &self.uuid)
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl PeerArbitrator {
    /// Build from the global settings. `secret` is the plaintext
    /// `arbitration-external-secret`.
    pub fn new(client: Arc<dyn HeartbeatClient>, settings: &Settings, secret: impl Into<String>) -> Self {
        let peers = settings.peer_hosts();
        let mut enabled = settings.arbitration_enabled();
        if enabled && peers.is_empty() {
            info!("arbitration peer not specified, disabling arbitration");
            enabled = false;
        }
        let status = if enabled {
            MonitorStatus::Standby
        } else {
            MonitorStatus::Active
        };
        Self {
            client,
            peers,
            enabled,
            uuid: uuid::Uuid::new_v4().to_string(),
            secret: secret.into(),
            log_heartbeat: settings.log_heartbeat(),
            state: Mutex::new(ArbitrationState {
                status,
                split_brain: false,
            }),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn peers(&self) -> &[String] {
        &self.peers
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    pub fn status(&self) -> MonitorStatus {
        lock(&self.state).status
    }

    pub fn split_brain(&self) -> bool {
        lock(&self.state).split_brain
    }

    /// Run one round. `None` when arbitration is disabled.
    ///
    /// Peers are queried without holding any lock; the aggregate is
    /// computed over the full set and then published once.
    pub fn round(&self) -> Option<RoundReport> {
        if !self.enabled {
            return None;
        }

        let peers: Vec<PeerStatus> = self.peers.iter().map(|peer| self.check(peer)).collect();
        let split_brain = peers.iter().any(PeerStatus::contributes_risk);
        let peer_active = peers.iter().any(PeerStatus::reports_active);

        let mut state = lock(&self.state);
        if state.split_brain != split_brain {
            if split_brain {
                warn!(peers = self.peers.len(), "split-brain risk raised");
            } else {
                info!(peers = self.peers.len(), "split-brain risk cleared");
            }
        }
        state.split_brain = split_brain;

        let promoted = state.status == MonitorStatus::Standby && !split_brain && !peer_active;
        if promoted {
            state.status = MonitorStatus::Active;
            info!(uuid = %self.uuid, "no active peer, promoting to active");
        }

        Some(RoundReport {
            peers,
            split_brain,
            status: state.status,
            promoted,
        })
    }

    fn check(&self, peer: &str) -> PeerStatus {
        let verdict = match self.client.fetch(peer) {
            Ok(hb) => {
                if self.log_heartbeat {
                    info!(peer = %peer, status = %hb.status, uuid = %hb.uuid, "heartbeat received");
                } else {
                    debug!(peer = %peer, status = %hb.status, "heartbeat received");
                }
                Verdict::Confirmed(hb)
            }
            Err(e) => {
                if self.log_heartbeat {
                    info!(peer = %peer, error = %e, "heartbeat failed");
                } else {
                    debug!(peer = %peer, error = %e, "heartbeat failed");
                }
                Verdict::Unknown(e.to_string())
            }
        };
        PeerStatus {
            peer: peer.to_string(),
            verdict,
        }
    }

    /// This instance's heartbeat document.
    pub fn heartbeat(&self, clusters: &[String], hosts: usize, failed: usize) -> Heartbeat {
        Heartbeat {
            uuid: self.uuid.clone(),
            secret: self.secret.clone(),
            cluster: clusters.join(","),
            master: String::new(),
            id: 0,
            status: self.status().code().to_string(),
            hosts,
            failed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockPeers;
    use fleet_settings::{SettingId, SettingValue};

    fn settings(peers: &str, enabled: bool) -> Settings {
        let mut settings = Settings::defaults();
        settings.set(SettingId::ArbitrationExternal, SettingValue::Bool(enabled));
        settings.set(SettingId::ArbitrationPeerHosts, SettingValue::Str(peers.to_string()));
        settings
    }

    fn heartbeat(status: &str) -> Heartbeat {
        Heartbeat {
            uuid: "peer".into(),
            status: status.into(),
            ..Default::default()
        }
    }

    // === Aggregation Tests ===

    #[test]
    fn test_one_unreachable_peer_raises_risk() {
        let peers = Arc::new(MockPeers::new());
        peers.respond("10.0.0.1:10001", heartbeat(STATUS_STANDBY));
        peers.respond("10.0.0.2:10001", heartbeat(STATUS_STANDBY));
        peers.unreachable("10.0.0.3:10001");
        let arb = PeerArbitrator::new(
            peers,
            &settings("10.0.0.1:10001,10.0.0.2:10001,10.0.0.3:10001", true),
            "",
        );

        let report = arb.round().unwrap();
        assert!(report.split_brain);
        assert_eq!(report.peers.iter().filter(|p| p.reachable()).count(), 2);
        assert!(arb.split_brain());
    }

    #[test]
    fn test_order_of_failure_does_not_matter() {
        let peers = Arc::new(MockPeers::new());
        peers.unreachable("a:1");
        peers.respond("b:1", heartbeat(STATUS_STANDBY));
        let arb = PeerArbitrator::new(peers, &settings("a:1,b:1", true), "");
        assert!(arb.round().unwrap().split_brain);
    }

    #[test]
    fn test_clean_round_clears_risk() {
        let peers = Arc::new(MockPeers::new());
        peers.unreachable("a:1");
        let arb = PeerArbitrator::new(peers.clone(), &settings("a:1", true), "");
        assert!(arb.round().unwrap().split_brain);

        peers.respond("a:1", heartbeat(STATUS_STANDBY));
        assert!(!arb.round().unwrap().split_brain);
        assert!(!arb.split_brain());
    }

    // === Status Tests ===

    #[test]
    fn test_standby_until_clean_round() {
        let peers = Arc::new(MockPeers::new());
        peers.unreachable("a:1");
        let arb = PeerArbitrator::new(peers.clone(), &settings("a:1", true), "");
        assert_eq!(arb.status(), MonitorStatus::Standby);

        let first = arb.round().unwrap();
        assert_eq!(first.status, MonitorStatus::Standby);
        assert!(!first.promoted);

        peers.respond("a:1", heartbeat(STATUS_STANDBY));
        let second = arb.round().unwrap();
        assert!(second.promoted);
        assert_eq!(arb.status(), MonitorStatus::Active);
        assert_eq!(arb.heartbeat(&[], 0, 0).status, STATUS_ACTIVE);
    }

    #[test]
    fn test_active_peer_keeps_standby() {
        let peers = Arc::new(MockPeers::new());
        peers.respond("a:1", heartbeat(STATUS_ACTIVE));
        let arb = PeerArbitrator::new(peers, &settings("a:1", true), "");
        let report = arb.round().unwrap();
        assert!(!report.split_brain);
        assert_eq!(report.status, MonitorStatus::Standby);
    }

    #[test]
    fn test_no_peers_disables_arbitration() {
        let arb = PeerArbitrator::new(Arc::new(MockPeers::new()), &settings("", true), "");
        assert!(!arb.is_enabled());
        assert_eq!(arb.status(), MonitorStatus::Active);
        assert!(arb.round().is_none());
    }

    #[test]
    fn test_heartbeat_document() {
        let arb = PeerArbitrator::new(Arc::new(MockPeers::new()), &settings("", false), "s3cret");
        let hb = arb.heartbeat(&["alpha".to_string(), "beta".to_string()], 4, 1);
        assert_eq!(hb.cluster, "alpha,beta");
        assert_eq!(hb.uuid, arb.uuid());
        assert_eq!(hb.secret, "s3cret");
        assert_eq!((hb.hosts, hb.failed), (4, 1));
    }
}
