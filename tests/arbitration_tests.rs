//! Peer arbitration through the fleet.

mod fixtures;

use fixtures::TestFleet;
use fleet_control::arbitration::{Heartbeat, MonitorStatus, STATUS_ACTIVE, STATUS_STANDBY};
use fleet_control::ClusterHandle;

const THREE_PEERS: &str = r#"
[Default]
arbitration-external = true
arbitration-peer-hosts = "10.0.0.1:10001,10.0.0.2:10001,10.0.0.3:10001"
arbitration-external-secret = "shared"

[alpha]
[beta]
"#;

fn standby() -> Heartbeat {
    Heartbeat {
        uuid: "peer".into(),
        status: STATUS_STANDBY.into(),
        ..Default::default()
    }
}

#[test]
fn test_one_silent_peer_raises_split_brain_everywhere() {
    let t = TestFleet::new(THREE_PEERS);
    t.peers.respond("10.0.0.1:10001", standby());
    t.peers.respond("10.0.0.2:10001", standby());
    // 10.0.0.3 has no script and times out.
    let fleet = t.start();

    let report = fleet.arbitrate().unwrap();
    assert!(report.split_brain);
    assert_eq!(report.peers.len(), 3);
    assert_eq!(report.peers.iter().filter(|p| p.contributes_risk()).count(), 1);
    assert!(fleet.split_brain());
    for cluster in fleet.clusters() {
        assert!(cluster.is_split_brain(), "{}", cluster.name());
    }
}

#[test]
fn test_clean_round_clears_flag_and_promotes() {
    let t = TestFleet::new(THREE_PEERS);
    t.peers.respond("10.0.0.1:10001", standby());
    t.peers.respond("10.0.0.2:10001", standby());
    let fleet = t.start();
    assert_eq!(fleet.arbitrator().status(), MonitorStatus::Standby);

    assert!(fleet.arbitrate().unwrap().split_brain);

    t.peers.respond("10.0.0.3:10001", standby());
    let report = fleet.arbitrate().unwrap();
    assert!(!report.split_brain);
    assert!(report.promoted);
    assert!(!fleet.split_brain());
    assert!(fleet.clusters().iter().all(|c| !c.is_split_brain()));
    assert_eq!(fleet.heartbeat().status, STATUS_ACTIVE);
}

#[test]
fn test_active_peer_keeps_this_instance_standby() {
    let t = TestFleet::new(THREE_PEERS);
    t.peers.respond("10.0.0.1:10001", standby());
    t.peers.respond(
        "10.0.0.2:10001",
        Heartbeat {
            status: STATUS_ACTIVE.into(),
            ..Default::default()
        },
    );
    t.peers.respond("10.0.0.3:10001", standby());
    let fleet = t.start();

    let report = fleet.arbitrate().unwrap();
    assert!(!report.split_brain);
    assert_eq!(report.status, MonitorStatus::Standby);
}

#[test]
fn test_every_peer_is_asked_each_round() {
    let t = TestFleet::new(THREE_PEERS);
    let fleet = t.start();
    fleet.arbitrate();
    fleet.arbitrate();
    assert_eq!(t.peers.requests().len(), 6);
}

#[test]
fn test_no_peers_disables_arbitration() {
    let t = TestFleet::new("[Default]\narbitration-external = true\n[alpha]\n");
    let fleet = t.start();
    assert!(!fleet.arbitrator().is_enabled());
    assert!(fleet.arbitrate().is_none());
    assert!(!fleet.split_brain());
}

#[test]
fn test_heartbeat_document_carries_secret_and_clusters() {
    let t = TestFleet::new(THREE_PEERS);
    let fleet = t.start();
    let hb = fleet.heartbeat();
    assert_eq!(hb.cluster, "alpha,beta");
    assert_eq!(hb.secret, "shared");
    assert_eq!(hb.status, STATUS_STANDBY);
    assert_eq!(hb.uuid, fleet.arbitrator().uuid());

    let json = serde_json::to_string(&hb).unwrap();
    let parsed: Heartbeat = serde_json::from_str(&json).unwrap();
    assert_eq!(parsed, hb);
}
