//! Git distribution: pull on start, push when changed, push coalescing and
//! token rotation.

mod fixtures;

use fixtures::TestFleet;
use fleet_control::git::GitError;
use fleet_control::mock::GitCall;
use fleet_control::{ClusterHandle, FleetError};
use fleet_settings::SettingId;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

const GIT: &str = r#"
[Default]
monitoring-save-config = true
git-url = "https://git.example.com/fleet.git"
git-username = "fleet"
git-access-token = "pat-1"
api-oauth-client-id = "client"
api-oauth-client-secret = "client-secret"
git-refresh-token = "refresh-1"
git-token-refresh-seconds = 60

[alpha]
"#;

// =============================================================================
// Pull and push
// =============================================================================

#[test]
fn test_pull_on_start_uses_configured_token() {
    let t = TestFleet::new(GIT);
    let _fleet = t.start_with_git();

    let calls = t.git.calls();
    assert_eq!(calls.len(), 1);
    match &calls[0] {
        GitCall::Pull { url, dir, token } => {
            assert_eq!(url, "https://git.example.com/fleet.git");
            assert_eq!(dir, &t.datadir());
            assert_eq!(token, "pat-1");
        }
        other => panic!("unexpected call {:?}", other),
    }
}

#[test]
fn test_failed_pull_on_start_is_not_fatal() {
    let t = TestFleet::new(GIT);
    t.git.fail_next_pull(GitError::Auth("HTTP Basic: Access denied".into()));
    let fleet = t.start_with_git();
    assert_eq!(fleet.cluster_names(), vec!["alpha".to_string()]);
}

#[test]
fn test_push_only_after_a_change() {
    let t = TestFleet::new(GIT);
    let fleet = t.start();

    assert!(fleet.save().unwrap());
    assert!(fleet.push_if_needed().unwrap());
    assert!(!fleet.save().unwrap());
    assert!(!fleet.push_if_needed().unwrap());
    assert_eq!(t.git.pushes(), 1);

    let gitignore = t.read(".gitignore");
    assert!(gitignore.contains(".fleet.key"));
    assert!(gitignore.contains(".pull/"));

    fleet.set_setting(Some("alpha"), "failover-mode", "automatic").unwrap();
    assert!(fleet.save().unwrap());
    assert!(fleet.push_if_needed().unwrap());
    assert_eq!(t.git.pushes(), 2);
}

#[test]
fn test_concurrent_push_requests_fold_into_one_follow_up() {
    let t = TestFleet::new(GIT);
    let fleet = Arc::new(t.start());
    t.git.set_push_delay(Duration::from_millis(300));
    let settings = fleet.git_settings();

    let first = {
        let fleet = Arc::clone(&fleet);
        let settings = settings.clone();
        thread::spawn(move || fleet.git().push_if_needed(&settings, true).unwrap())
    };
    thread::sleep(Duration::from_millis(100));

    let barrier = Arc::new(Barrier::new(5));
    let waiters: Vec<_> = (0..5)
        .map(|_| {
            let fleet = Arc::clone(&fleet);
            let settings = settings.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                fleet.git().push_if_needed(&settings, true).unwrap()
            })
        })
        .collect();

    assert!(first.join().unwrap());
    for waiter in waiters {
        assert!(!waiter.join().unwrap());
    }
    assert_eq!(t.git.pushes(), 2);
}

// =============================================================================
// Token rotation
// =============================================================================

#[test]
fn test_token_refresh_rotates_and_hot_swaps() {
    let t = TestFleet::new(GIT);
    t.oauth.grant("oauth-access", Some("refresh-2"));
    t.oauth.rotate_to("pat-2");
    let fleet = t.start();

    assert!(!fleet.refresh_git_token_if_due(Instant::now()).unwrap());
    let later = Instant::now() + Duration::from_secs(61);
    assert!(fleet.refresh_git_token_if_due(later).unwrap());

    assert_eq!(t.oauth.refreshed_with(), vec!["refresh-1".to_string()]);
    assert_eq!(t.oauth.rotated_with(), vec!["oauth-access".to_string()]);
    assert_eq!(fleet.git_settings().auth.token, "pat-2");
    assert_eq!(fleet.git_settings().refresh_token, "refresh-2");
    for cluster in fleet.clusters() {
        assert_eq!(
            cluster.decrypted_value(SettingId::GitAccessToken).as_deref(),
            Some("pat-2")
        );
    }

    // Attempt time counts, the next refresh is a full period away.
    assert!(!fleet.refresh_git_token_if_due(later + Duration::from_secs(30)).unwrap());

    fleet.save().unwrap();
    assert!(fleet.push_if_needed().unwrap());
    let pushed_with = t.git.calls().into_iter().find_map(|call| match call {
        GitCall::Push { token, .. } => Some(token),
        _ => None,
    });
    assert_eq!(pushed_with.as_deref(), Some("pat-2"));
    assert!(!t.read_all().contains("pat-2"));
}

#[test]
fn test_invalid_grant_keeps_current_token() {
    let t = TestFleet::new(GIT);
    t.oauth.fail_refresh(GitError::InvalidGrant("token revoked".into()));
    let fleet = t.start();

    let err = fleet
        .refresh_git_token_if_due(Instant::now() + Duration::from_secs(61))
        .unwrap_err();
    assert!(matches!(err, FleetError::Git(GitError::InvalidGrant(_))));
    assert_eq!(fleet.git_settings().auth.token, "pat-1");
    assert!(t.oauth.rotated_with().is_empty());
}
