//! Managed clusters.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Instant;
use tracing::{debug, info};

use fleet_settings::{SettingId, SettingValue};

use crate::config::ResolvedScope;
use crate::persist::{cluster_artifact, Artifact, LiveCredentials, Renderer};
use crate::vault::{parse_credentials, CredentialEntry, VaultError};

/// File name of a cluster's access control list.
pub const ACLS_FILE: &str = "acls.json";

/// Composite settings holding API users.
const CREDENTIAL_SETTINGS: [SettingId; 2] = [SettingId::ApiCredentials, SettingId::ApiCredentialsExternal];

/// Process-wide order of password changes across clusters.
static PASSWORD_REVISION: AtomicU64 = AtomicU64::new(0);

/// One API user with its grants on a cluster.
#[derive(Clone, PartialEq, Eq)]
pub struct ApiUser {
    pub user: String,
    pub password: String,
    /// Composite setting the user is declared in.
    pub source: SettingId,
    pub grants: BTreeSet<String>,
    /// Order of the last password change, 0 for a password read from
    /// configuration.
    pub revision: u64,
}

impl std::fmt::Debug for ApiUser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiUser")
            .field("user", &self.user)
            .field("source", &self.source)
            .field("grants", &self.grants)
            .field("revision", &self.revision)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Serialize)]
struct UserAcl<'a> {
    source: &'static str,
    grants: &'a BTreeSet<String>,
}

/// Cluster surface consumed by the fleet and the scheduler.
pub trait ClusterHandle: Send + Sync {
    fn name(&self) -> &str;

    /// Artifacts this cluster persists: its saved snapshot and its ACLs.
    fn save(&self, renderer: &Renderer<'_>) -> Result<Vec<Artifact>, VaultError>;

    /// Rebuild API users from the credential settings, keeping grants of
    /// users that already existed.
    fn load_api_users(&self) -> Vec<ApiUser>;

    /// Render `acls.json`.
    fn save_acls(&self) -> Artifact;

    fn decrypted_value(&self, id: SettingId) -> Option<String>;

    /// Copy of the resolved configuration.
    fn effective_config(&self) -> ResolvedScope;

    /// The cluster changed something that must reach the git remote.
    fn needs_git_push(&self) -> bool;
    fn clear_git_push(&self);

    fn set_split_brain(&self, split_brain: bool);
    fn is_split_brain(&self) -> bool;

    /// Replace the git access token without interrupting running work.
    fn set_git_token(&self, token: &str) -> Result<(), VaultError>;

    /// One pass of the cluster's own monitor.
    fn monitor_tick(&self);
}

#[derive(Debug, Default)]
struct ClusterState {
    split_brain: bool,
    needs_git_push: bool,
    api_users: BTreeMap<String, ApiUser>,
    ticks: u64,
    last_tick: Option<Instant>,
}

/// A cluster under monitoring.
#[derive(Debug)]
pub struct ManagedCluster {
    name: String,
    config: Mutex<ResolvedScope>,
    state: Mutex<ClusterState>,
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ManagedCluster {
    pub fn new(scope: ResolvedScope) -> Self {
        let cluster = Self {
            name: scope.name.clone(),
            config: Mutex::new(scope),
            state: Mutex::new(ClusterState::default()),
        };
        cluster.load_api_users();
        cluster
    }

    /// Locked access to the configuration for setting dispatch.
    pub fn config(&self) -> MutexGuard<'_, ResolvedScope> {
        lock(&self.config)
    }

    /// Enable or disable a grant for a user. Returns false for an unknown
    /// user.
    pub fn set_grant(&self, user: &str, grant: &str, enabled: bool) -> bool {
        let mut state = lock(&self.state);
        let Some(api_user) = state.api_users.get_mut(user) else {
            return false;
        };
        let changed = if enabled {
            api_user.grants.insert(grant.to_string())
        } else {
            api_user.grants.remove(grant)
        };
        if changed {
            debug!(cluster = %self.name, user = %user, grant = %grant, enabled, "grant updated");
            state.needs_git_push = true;
        }
        true
    }

    /// Change a user's password in the live records.
    pub fn set_user_password(&self, user: &str, password: &str) -> bool {
        let mut state = lock(&self.state);
        match state.api_users.get_mut(user) {
            Some(api_user) => {
                api_user.password = password.to_string();
                api_user.revision = PASSWORD_REVISION.fetch_add(1, Ordering::SeqCst) + 1;
                true
            }
            None => false,
        }
    }

    pub fn api_users(&self) -> Vec<ApiUser> {
        lock(&self.state).api_users.values().cloned().collect()
    }

    /// Live credential entries grouped by composite setting.
    pub fn live_credentials(&self) -> LiveCredentials {
        let state = lock(&self.state);
        let mut live = LiveCredentials::new();
        for user in state.api_users.values() {
            live.entry(user.source).or_default().push(CredentialEntry {
                user: user.user.clone(),
                password: user.password.clone(),
            });
        }
        live
    }

    pub fn ticks(&self) -> u64 {
        lock(&self.state).ticks
    }

    pub fn last_tick(&self) -> Option<Instant> {
        lock(&self.state).last_tick
    }

    /// Flag a change that must be pushed.
    pub fn request_git_push(&self) {
        lock(&self.state).needs_git_push = true;
    }

    fn acls_path(&self) -> PathBuf {
        PathBuf::from(&self.name).join(ACLS_FILE)
    }
}

impl ClusterHandle for ManagedCluster {
    fn name(&self) -> &str {
        &self.name
    }

    fn save(&self, renderer: &Renderer<'_>) -> Result<Vec<Artifact>, VaultError> {
        let snapshot = renderer.cluster(&self.config())?;
        Ok(vec![snapshot, self.save_acls()])
    }

    fn load_api_users(&self) -> Vec<ApiUser> {
        let declared: Vec<(SettingId, CredentialEntry)> = {
            let config = self.config();
            CREDENTIAL_SETTINGS
                .iter()
                .flat_map(|&id| {
                    let raw = config
                        .vault
                        .decrypted(id)
                        .unwrap_or_else(|| config.settings.str(id).to_string());
                    parse_credentials(&raw).into_iter().map(move |entry| (id, entry))
                })
                .collect()
        };

        let mut state = lock(&self.state);
        let mut users = BTreeMap::new();
        for (source, entry) in declared {
            if entry.user.is_empty() || users.contains_key(&entry.user) {
                continue;
            }
            let previous = state.api_users.get(&entry.user);
            let grants = previous.map(|u| u.grants.clone()).unwrap_or_default();
            let revision = previous
                .filter(|u| u.password == entry.password)
                .map_or(0, |u| u.revision);
            users.insert(
                entry.user.clone(),
                ApiUser {
                    user: entry.user,
                    password: entry.password,
                    source,
                    grants,
                    revision,
                },
            );
        }
        debug!(cluster = %self.name, users = users.len(), "api users loaded");
        state.api_users = users;
        state.api_users.values().cloned().collect()
    }

    fn save_acls(&self) -> Artifact {
        let state = lock(&self.state);
        let acls: BTreeMap<&str, UserAcl<'_>> = state
            .api_users
            .values()
            .map(|u| {
                (
                    u.user.as_str(),
                    UserAcl {
                        source: u.source.name(),
                        grants: &u.grants,
                    },
                )
            })
            .collect();
        let body = serde_json::to_string_pretty(&acls).unwrap_or_else(|_| "{}".to_string()) + "\n";
        Artifact::raw(format!("{}/acls", cluster_artifact(&self.name)), self.acls_path(), body)
    }

    fn decrypted_value(&self, id: SettingId) -> Option<String> {
        self.config().vault.decrypted(id)
    }

    fn effective_config(&self) -> ResolvedScope {
        self.config().clone()
    }

    fn needs_git_push(&self) -> bool {
        lock(&self.state).needs_git_push
    }

    fn clear_git_push(&self) {
        lock(&self.state).needs_git_push = false;
    }

    fn set_split_brain(&self, split_brain: bool) {
        let mut state = lock(&self.state);
        if state.split_brain != split_brain {
            debug!(cluster = %self.name, split_brain, "split-brain flag updated");
        }
        state.split_brain = split_brain;
    }

    fn is_split_brain(&self) -> bool {
        lock(&self.state).split_brain
    }

    fn set_git_token(&self, token: &str) -> Result<(), VaultError> {
        let mut config = self.config();
        let id = SettingId::GitAccessToken;
        config.vault.set_plaintext(id, token)?;
        config.settings.set(id, SettingValue::Str(token.to_string()));
        if config.snapshot.is_immutable(id) {
            config.snapshot.record_immutable(id, SettingValue::Str(token.to_string()));
        }
        info!(cluster = %self.name, "git access token replaced");
        Ok(())
    }

    fn monitor_tick(&self) {
        let split_brain = {
            let mut state = lock(&self.state);
            state.ticks += 1;
            state.last_tick = Some(Instant::now());
            state.split_brain
        };
        if split_brain {
            debug!(cluster = %self.name, "split-brain risk asserted, failover actions suspended");
        }
    }
}
