//! Layered resolution through the fleet entry points.

mod fixtures;

use fixtures::TestFleet;
use fleet_control::config::SourceOrigin;
use fleet_control::{FleetError, SetOutcome};
use fleet_settings::{SettingError, SettingId, SettingValue};

const CONFIG: &str = r#"
[Default]
monitoring-save-config = true
failover-limit = 5

[A]
failover-limit = 3

[B]
"#;

// =============================================================================
// Precedence
// =============================================================================

#[test]
fn test_cluster_section_beats_global_section() {
    let t = TestFleet::new(CONFIG);
    let fleet = t.start();

    assert_eq!(fleet.cluster_names(), vec!["A".to_string(), "B".to_string()]);
    assert_eq!(fleet.resolve("failover-limit", Some("A")).unwrap(), SettingValue::Int(3));
    assert_eq!(fleet.resolve("failover-limit", Some("B")).unwrap(), SettingValue::Int(5));
    assert_eq!(fleet.resolve("failover-limit", None).unwrap(), SettingValue::Int(5));
}

#[test]
fn test_command_line_beats_files() {
    let mut t = TestFleet::new(CONFIG);
    t.overrides.push(("failover-limit".into(), "8".into()));
    let fleet = t.start();

    assert_eq!(fleet.resolve("failover-limit", Some("A")).unwrap(), SettingValue::Int(8));
    assert_eq!(fleet.resolve("failover-limit", Some("B")).unwrap(), SettingValue::Int(8));
}

#[test]
fn test_include_directory_adds_clusters() {
    let t = TestFleet::new(CONFIG);
    t.include("gamma.toml", "[gamma]\nfailover-mode = \"automatic\"\n");
    let fleet = t.start();

    assert!(fleet.cluster_names().contains(&"gamma".to_string()));
    assert_eq!(
        fleet.resolve("failover-mode", Some("gamma")).unwrap(),
        SettingValue::Str("automatic".into())
    );
}

// =============================================================================
// Immutable wins
// =============================================================================

#[test]
fn test_pinned_value_survives_runtime_write_and_is_audited() {
    let t = TestFleet::new(CONFIG);
    let fleet = t.start();

    let outcome = fleet.set_setting(Some("A"), "failover-limit", "10").unwrap();
    assert_eq!(outcome, SetOutcome::RecordedOnly);
    assert_eq!(fleet.resolve("failover-limit", Some("A")).unwrap(), SettingValue::Int(3));

    fleet.save().unwrap();
    let saved = t.read("A/A.toml");
    assert!(saved.contains("[saved-A]"), "{}", saved);
    assert!(saved.contains("failover-limit = 10"), "{}", saved);

    drop(fleet);
    let restarted = t.start();
    assert_eq!(restarted.resolve("failover-limit", Some("A")).unwrap(), SettingValue::Int(3));
    let cluster = restarted.cluster("A").unwrap();
    assert_eq!(
        cluster.config().snapshot.dynamic.get(&SettingId::FailoverLimit),
        Some(&SettingValue::Int(10))
    );
}

#[test]
fn test_runtime_value_restored_after_restart() {
    let t = TestFleet::new(CONFIG);
    let fleet = t.start();
    assert_eq!(
        fleet.set_setting(Some("B"), "failover-mode", "automatic").unwrap(),
        SetOutcome::Applied
    );
    fleet.save().unwrap();
    drop(fleet);

    let restarted = t.start();
    assert_eq!(
        restarted.resolve("failover-mode", Some("B")).unwrap(),
        SettingValue::Str("automatic".into())
    );
    assert_eq!(
        restarted.resolve("failover-mode", Some("A")).unwrap(),
        SettingValue::Str("manual".into())
    );
}

#[test]
fn test_restore_on_start_ignores_saved_values() {
    let mut t = TestFleet::new(CONFIG);
    let fleet = t.start();
    fleet.set_setting(Some("B"), "failover-mode", "automatic").unwrap();
    fleet.save().unwrap();
    drop(fleet);

    t.overrides
        .push(("monitoring-restore-config-on-start".into(), "true".into()));
    let restarted = t.start();
    assert_eq!(
        restarted.resolve("failover-mode", Some("B")).unwrap(),
        SettingValue::Str("manual".into())
    );
}

// =============================================================================
// Overrides
// =============================================================================

#[test]
fn test_promotion_skips_pinned_cluster_and_persists() {
    let t = TestFleet::new(CONFIG);
    let fleet = t.start();

    let promoted = fleet.promote_override("failover-limit", "7").unwrap();
    assert_eq!(promoted, vec!["B".to_string()]);
    fleet.save().unwrap();
    assert!(t.read("overwrite.toml").contains("failover-limit = 7"));
    drop(fleet);

    let restarted = t.start();
    assert_eq!(restarted.resolve("failover-limit", Some("A")).unwrap(), SettingValue::Int(3));
    assert_eq!(restarted.resolve("failover-limit", Some("B")).unwrap(), SettingValue::Int(7));
}

#[test]
fn test_promotion_reaches_pseudo_cluster_across_restart() {
    let t = TestFleet::new(
        "[Default]\nmonitoring-save-config = true\nfailover-limit = 4\nmonitoring-ticker = 5\n",
    );
    let fleet = t.start();
    assert_eq!(fleet.cluster_names(), vec!["Default".to_string()]);

    let promoted = fleet.promote_override("failover-limit", "7").unwrap();
    assert_eq!(promoted, vec!["Default".to_string()]);
    assert_eq!(fleet.resolve("failover-limit", Some("Default")).unwrap(), SettingValue::Int(7));
    fleet.save().unwrap();
    drop(fleet);

    let restarted = t.start();
    assert_eq!(restarted.cluster_names(), vec!["Default".to_string()]);
    assert_eq!(restarted.resolve("failover-limit", None).unwrap(), SettingValue::Int(7));
    assert_eq!(
        restarted.resolve("failover-limit", Some("Default")).unwrap(),
        SettingValue::Int(7)
    );

    // `[Default]` applies once, as the global layer, so server keys in it
    // are never checked against cluster scope.
    let config = restarted.cluster("Default").unwrap().config().clone();
    let reads = config
        .sources
        .iter()
        .filter(|s| s.origin == SourceOrigin::Global)
        .count();
    assert_eq!(reads, 1);
    assert!(config.base_values.is_empty());
    assert_eq!(restarted.resolve("monitoring-ticker", None).unwrap(), SettingValue::Int(5));
}

// =============================================================================
// Dispatch errors
// =============================================================================

#[test]
fn test_unknown_setting_and_bad_input_are_distinct() {
    let t = TestFleet::new(CONFIG);
    let fleet = t.start();

    let unknown = fleet.set_setting(None, "failover-limitt", "1").unwrap_err();
    assert!(matches!(unknown, FleetError::Setting(SettingError::Unknown(_))));
    assert!(unknown.is_not_found());

    let bad = fleet.set_setting(None, "failover-limit", "-4").unwrap_err();
    assert!(bad.is_client_error());
    assert!(!bad.is_not_found());

    assert!(matches!(
        fleet.resolve("failover-limit", Some("nope")),
        Err(FleetError::UnknownCluster(_))
    ));
}
