//! The fleet context.
//!
//! `Fleet` is built once at process start and owns the global scope, every
//! managed cluster, the persistence writer, git distribution and peer
//! arbitration. Setting dispatch, saves and the scheduler all go through it.

mod cluster;

pub use cluster::{ApiUser, ClusterHandle, ManagedCluster, ACLS_FILE};

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info, warn};

use fleet_settings::{
    Handler, Registry, SecretKind, SettingError, SettingId, SettingScope, SettingValue,
};

use crate::arbitration::{
    heartbeat_timeout, Heartbeat, HeartbeatClient, HttpHeartbeatClient, PeerArbitrator, PeerError,
    RoundReport,
};
use crate::config::{
    cluster_snapshot_path, ConfigError, ConfigSources, LayeredResolver, ResolvedScope, SourceOptions,
    GLOBAL_SCOPE,
};
use crate::git::{
    GitBackend, GitCli, GitError, GitLabOAuth, GitSettings, GitSync, OAuthClient, SaveGate,
    TenantUpdate,
};
use crate::persist::{
    cluster_artifact, export_to_backup, LiveCredentials, PersistError, PersistenceWriter, Renderer,
};
use crate::vault::{decode_wire, Cipher, CredentialEntry, EncryptionKey, KeyOrigin, VaultError, KEY_FILE_NAME};

use cluster::lock;

/// Errors surfaced by fleet operations.
#[derive(Debug, Error)]
pub enum FleetError {
    #[error(transparent)]
    Setting(#[from] SettingError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Vault(#[from] VaultError),

    #[error(transparent)]
    Persist(#[from] PersistError),

    #[error(transparent)]
    Git(#[from] GitError),

    #[error(transparent)]
    Peer(#[from] PeerError),

    #[error("unknown cluster '{0}'")]
    UnknownCluster(String),

    #[error("working directory {} is not usable: {source}", path.display())]
    Datadir { path: PathBuf, source: io::Error },
}

impl FleetError {
    /// Errors caused by the caller's input.
    pub fn is_client_error(&self) -> bool {
        match self {
            Self::Setting(e) => e.is_client_error(),
            Self::Vault(VaultError::BadInput { .. } | VaultError::NotSecret(_)) => true,
            _ => false,
        }
    }

    /// Errors a caller should report as "not found".
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Setting(SettingError::Unknown(_)) | Self::UnknownCluster(_))
    }
}

/// Result of a runtime setting write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetOutcome {
    /// The value is now in effect.
    Applied,
    /// The key is pinned by a static source; the value was kept for audit
    /// only.
    RecordedOnly,
}

/// External services the fleet talks to.
pub struct Collaborators {
    pub git: Arc<dyn GitBackend>,
    pub oauth: Arc<dyn OAuthClient>,
    /// Built from `monitoring-ticker` when not given.
    pub heartbeat: Option<Arc<dyn HeartbeatClient>>,
}

impl Collaborators {
    /// The git CLI, GitLab OAuth and HTTP heartbeats.
    pub fn live() -> Result<Self, FleetError> {
        Ok(Self {
            git: Arc::new(GitCli::default()),
            oauth: Arc::new(GitLabOAuth::new()?),
            heartbeat: None,
        })
    }
}

#[derive(Debug, Default)]
struct FleetState {
    clusters: BTreeMap<String, Arc<ManagedCluster>>,
    split_brain: bool,
}

/// Process-wide context.
pub struct Fleet {
    registry: Registry,
    sources: ConfigSources,
    cipher: Arc<Cipher>,
    global: Mutex<ResolvedScope>,
    state: Mutex<FleetState>,
    writer: Mutex<PersistenceWriter>,
    save_gate: SaveGate,
    needs_push: AtomicBool,
    git: GitSync,
    arbitrator: PeerArbitrator,
}

impl std::fmt::Debug for Fleet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fleet")
            .field("datadir", &self.sources.datadir())
            .field("clusters", &self.cluster_names())
            .finish_non_exhaustive()
    }
}

impl Fleet {
    /// Build the fleet from its configuration sources.
    ///
    /// With `init_git`, the configuration repository is pulled first and the
    /// sources are read again so remote state seeds local state. An
    /// unparsable main file or an unusable working directory is fatal.
    pub fn init_config(
        options: &SourceOptions,
        init_git: bool,
        collaborators: Collaborators,
    ) -> Result<Self, FleetError> {
        let mut sources = ConfigSources::load(options)?;
        let datadir = sources.datadir().to_path_buf();
        fs::create_dir_all(&datadir).map_err(|source| FleetError::Datadir {
            path: datadir.clone(),
            source,
        })?;

        let cipher = Arc::new(Cipher::new(&load_key(&datadir)));
        let registry = Registry::builtin();
        let git = GitSync::new(collaborators.git, collaborators.oauth, &datadir);

        if init_git {
            let global = LayeredResolver::new(&registry, &sources, cipher.clone()).resolve_global();
            match git.pull_on_start(&GitSettings::from_scope(&global)) {
                Ok(()) => sources = ConfigSources::load(options)?,
                Err(e) => warn!(error = %e, "pull on start failed, continuing with local state"),
            }
        }

        Ok(Self::assemble(registry, sources, cipher, git, collaborators.heartbeat))
    }

    /// Build from already loaded sources without touching git.
    pub fn from_sources(
        sources: ConfigSources,
        cipher: Arc<Cipher>,
        collaborators: Collaborators,
    ) -> Self {
        let git = GitSync::new(collaborators.git, collaborators.oauth, sources.datadir());
        Self::assemble(Registry::builtin(), sources, cipher, git, collaborators.heartbeat)
    }

    fn assemble(
        registry: Registry,
        sources: ConfigSources,
        cipher: Arc<Cipher>,
        git: GitSync,
        heartbeat: Option<Arc<dyn HeartbeatClient>>,
    ) -> Self {
        let (global, clusters) = {
            let resolver = LayeredResolver::new(&registry, &sources, cipher.clone());
            let global = resolver.resolve_global();
            let clusters: BTreeMap<String, Arc<ManagedCluster>> = sources
                .cluster_names()
                .into_iter()
                .map(|name| {
                    let scope = resolver.resolve_cluster(&name);
                    (name, Arc::new(ManagedCluster::new(scope)))
                })
                .collect();
            (global, clusters)
        };
        info!(
            datadir = %sources.datadir().display(),
            clusters = clusters.len(),
            save_config = global.settings.save_config(),
            "configuration resolved"
        );

        let heartbeat = heartbeat.unwrap_or_else(|| http_heartbeat(global.settings.monitoring_ticker()));
        let secret = global
            .vault
            .decrypted(SettingId::ArbitrationExternalSecret)
            .unwrap_or_default();
        let arbitrator = PeerArbitrator::new(heartbeat, &global.settings, secret);

        Self {
            writer: Mutex::new(PersistenceWriter::new(sources.datadir())),
            registry,
            sources,
            cipher,
            global: Mutex::new(global),
            state: Mutex::new(FleetState {
                clusters,
                split_brain: false,
            }),
            save_gate: SaveGate::new(),
            needs_push: AtomicBool::new(false),
            git,
            arbitrator,
        }
    }

    pub fn datadir(&self) -> &Path {
        self.sources.datadir()
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn cipher(&self) -> &Arc<Cipher> {
        &self.cipher
    }

    pub fn git(&self) -> &GitSync {
        &self.git
    }

    pub fn arbitrator(&self) -> &PeerArbitrator {
        &self.arbitrator
    }

    /// Locked global scope.
    pub fn global(&self) -> MutexGuard<'_, ResolvedScope> {
        lock(&self.global)
    }

    pub fn cluster_names(&self) -> Vec<String> {
        lock(&self.state).clusters.keys().cloned().collect()
    }

    pub fn cluster(&self, name: &str) -> Result<Arc<ManagedCluster>, FleetError> {
        lock(&self.state)
            .clusters
            .get(name)
            .cloned()
            .ok_or_else(|| FleetError::UnknownCluster(name.to_string()))
    }

    pub fn clusters(&self) -> Vec<Arc<ManagedCluster>> {
        lock(&self.state).clusters.values().cloned().collect()
    }

    pub fn split_brain(&self) -> bool {
        lock(&self.state).split_brain
    }

    // === Setting dispatch ===

    /// Set a value at runtime. `cluster` is `None` for the global scope.
    ///
    /// A key pinned by a static source keeps its value; the write is kept in
    /// the scope's dynamic map for audit and reported as
    /// [`SetOutcome::RecordedOnly`].
    pub fn set_setting(&self, cluster: Option<&str>, name: &str, raw: &str) -> Result<SetOutcome, FleetError> {
        let handler = *self.registry.lookup(name)?;
        handler.check_scope(cluster.is_some())?;
        let value = handler.validate(raw)?;
        self.dispatch(cluster, handler, value)
    }

    /// Set a secret from its base64 wire form. Malformed input mutates
    /// nothing.
    pub fn set_secret(&self, cluster: Option<&str>, name: &str, encoded: &str) -> Result<SetOutcome, FleetError> {
        let handler = *self.registry.lookup(name)?;
        if !handler.is_secret() {
            return Err(VaultError::NotSecret(handler.id()).into());
        }
        handler.check_scope(cluster.is_some())?;
        let plaintext = decode_wire(handler.id(), encoded)?;
        let value = handler.validate(&plaintext)?;
        self.dispatch(cluster, handler, value)
    }

    fn dispatch(&self, cluster: Option<&str>, handler: Handler, value: SettingValue) -> Result<SetOutcome, FleetError> {
        let id = handler.id();
        let outcome = match cluster {
            Some(name) => {
                let target = self.cluster(name)?;
                let outcome = apply_dynamic(&mut target.config(), handler, value, true)?;
                if id.secret_kind() == SecretKind::Composite {
                    target.load_api_users();
                }
                outcome
            }
            None => {
                let outcome = apply_dynamic(&mut self.global(), handler, value.clone(), true)?;
                if outcome == SetOutcome::Applied {
                    self.propagate(handler, value)?;
                }
                outcome
            }
        };
        info!(
            scope = cluster.unwrap_or(GLOBAL_SCOPE),
            key = %id,
            outcome = ?outcome,
            "setting updated"
        );
        Ok(outcome)
    }

    /// Carry a global write to every cluster that neither pins the key nor
    /// set it itself, as a restart would.
    fn propagate(&self, handler: Handler, value: SettingValue) -> Result<(), FleetError> {
        let id = handler.id();
        for cluster in self.clusters() {
            {
                let mut config = cluster.config();
                if config.snapshot.is_immutable(id) || config.snapshot.dynamic.contains_key(&id) {
                    continue;
                }
                apply_dynamic(&mut config, handler, value.clone(), false)?;
            }
            if id.secret_kind() == SecretKind::Composite {
                cluster.load_api_users();
            }
        }
        Ok(())
    }

    /// Promote a value to every cluster through the shared-override layer.
    ///
    /// Clusters whose own section or command line pins the key keep their
    /// value. Returns the clusters that took the value.
    pub fn promote_override(&self, name: &str, raw: &str) -> Result<Vec<String>, FleetError> {
        let handler = *self.registry.lookup(name)?;
        let id = handler.id();
        let value = handler.validate(raw)?;

        {
            let mut global = self.global();
            apply_static(&mut global, handler, value.clone())?;
            global.snapshot.record_override(id, value.clone());
        }

        let mut promoted = Vec::new();
        for cluster in self.clusters() {
            let mut config = cluster.config();
            if !config.accepts_override(id) {
                debug!(cluster = %config.name, key = %id, "cluster pins key, override not applied");
                continue;
            }
            apply_static(&mut config, handler, value.clone())?;
            config.snapshot.record_override(id, value.clone());
            promoted.push(config.name.clone());
        }
        info!(key = %id, clusters = promoted.len(), "override promoted");
        Ok(promoted)
    }

    /// Effective value of a registered setting.
    pub fn resolve(&self, name: &str, cluster: Option<&str>) -> Result<SettingValue, FleetError> {
        let id = self.registry.lookup(name)?.id();
        Ok(match cluster {
            Some(c) => self.cluster(c)?.config().settings.get(id).clone(),
            None => self.global().settings.get(id).clone(),
        })
    }

    /// Effective configuration with secrets replaced by a placeholder.
    pub fn redacted_config(&self, cluster: Option<&str>) -> Result<BTreeMap<String, toml::Value>, FleetError> {
        Ok(match cluster {
            Some(c) => self.cluster(c)?.config().redacted(),
            None => self.global().redacted(),
        })
    }

    /// Ciphertext of a secret as it would be stored, `None` when unset.
    pub fn encrypted_value_from_memory(&self, cluster: Option<&str>, name: &str) -> Result<Option<String>, FleetError> {
        let id = self.registry.lookup(name)?.id();
        if !id.is_secret() {
            return Err(VaultError::NotSecret(id).into());
        }
        if id.secret_kind() == SecretKind::Composite {
            let (live, vault) = match cluster {
                Some(c) => {
                    let target = self.cluster(c)?;
                    let vault = target.config().vault.clone();
                    (target.live_credentials(), vault)
                }
                None => (self.live_credentials(), self.global().vault.clone()),
            };
            let entries = live.get(&id).map(Vec::as_slice).unwrap_or(&[]);
            return Ok(Some(vault.encrypted_composite(id, entries)?));
        }
        Ok(match cluster {
            Some(c) => self.cluster(c)?.config().vault.encrypted_for_storage(id)?,
            None => self.global().vault.encrypted_for_storage(id)?,
        })
    }

    // === Persistence ===

    /// Persist every artifact that changed. Returns whether anything changed.
    ///
    /// A save requested while another is running is folded into one
    /// follow-up save and returns `Ok(false)` at once.
    pub fn save(&self) -> Result<bool, FleetError> {
        let mut result: Result<bool, FleetError> = Ok(false);
        self.save_gate.run(|| {
            let pass = self.save_once();
            result = match (std::mem::replace(&mut result, Ok(false)), pass) {
                (Err(e), _) | (Ok(_), Err(e)) => Err(e),
                (Ok(a), Ok(b)) => Ok(a || b),
            };
        });
        result
    }

    fn save_once(&self) -> Result<bool, FleetError> {
        let live = self.live_credentials();
        let clusters = self.clusters();

        let (global_artifacts, cluster_artifacts) = {
            let global = self.global();
            if !global.settings.save_config() {
                debug!("monitoring-save-config is off, nothing persisted");
                return Ok(false);
            }
            let renderer = Renderer::new(&self.cipher, &live);
            let global_artifacts = vec![
                renderer.immutable(&global)?,
                renderer.saved_default(&global)?,
                renderer.overwrite(&global)?,
            ];
            let mut cluster_artifacts = Vec::with_capacity(clusters.len());
            for cluster in &clusters {
                cluster_artifacts.push(cluster.save(&renderer)?);
            }
            (global_artifacts, cluster_artifacts)
        };

        let report = {
            let mut writer = lock(&self.writer);
            let mut report = writer.save(global_artifacts);
            for artifacts in cluster_artifacts {
                report.merge(writer.save(artifacts));
            }
            report
        };
        if report.changed {
            info!(
                written = report.written.len(),
                skipped = report.skipped.len(),
                failed = report.errors.len(),
                "configuration saved"
            );
        }
        if !report.written.is_empty() && report.changed {
            self.needs_push.store(true, Ordering::SeqCst);
        }
        Ok(report.into_result()?)
    }

    /// Credential entries of every cluster merged per composite setting.
    /// When clusters disagree on a user's password the most recent change
    /// wins; unchanged passwords keep the first cluster in name order.
    fn live_credentials(&self) -> LiveCredentials {
        let mut merged: BTreeMap<SettingId, Vec<(u64, CredentialEntry)>> = BTreeMap::new();
        for cluster in self.clusters() {
            for user in cluster.api_users() {
                let entries = merged.entry(user.source).or_default();
                let revision = user.revision;
                let entry = CredentialEntry {
                    user: user.user,
                    password: user.password,
                };
                match entries.iter_mut().find(|(_, e)| e.user == entry.user) {
                    Some(slot) if revision > slot.0 => *slot = (revision, entry),
                    Some(_) => {}
                    None => entries.push((revision, entry)),
                }
            }
        }
        merged
            .into_iter()
            .map(|(id, entries)| (id, entries.into_iter().map(|(_, entry)| entry).collect()))
            .collect()
    }

    /// Stop monitoring a cluster and discard its snapshot.
    pub fn remove_cluster(&self, name: &str) -> Result<(), FleetError> {
        lock(&self.state)
            .clusters
            .remove(name)
            .ok_or_else(|| FleetError::UnknownCluster(name.to_string()))?;
        lock(&self.writer).forget(&cluster_artifact(name));

        let datadir = self.datadir();
        for path in [
            cluster_snapshot_path(datadir, name),
            datadir.join(name).join(ACLS_FILE),
        ] {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %path.display(), error = %e, "failed to remove cluster file"),
            }
        }
        self.needs_push.store(true, Ordering::SeqCst);
        info!(cluster = %name, "cluster removed");
        Ok(())
    }

    /// Start monitoring a cluster resolved from the startup sources and the
    /// saved snapshot, if any.
    pub fn add_cluster(&self, name: &str) -> Arc<ManagedCluster> {
        if let Ok(existing) = self.cluster(name) {
            return existing;
        }
        let scope = LayeredResolver::new(&self.registry, &self.sources, self.cipher.clone()).resolve_cluster(name);
        let cluster = Arc::new(ManagedCluster::new(scope));
        lock(&self.state)
            .clusters
            .insert(name.to_string(), cluster.clone());
        info!(cluster = %name, "cluster added");
        cluster
    }

    /// Copy every saved file to `monitoring-confdir-backup` when set.
    pub fn export_backup(&self) -> Result<usize, FleetError> {
        let target = self
            .global()
            .settings
            .non_empty(SettingId::MonitoringConfdirBackup)
            .map(PathBuf::from);
        match target {
            Some(dir) => Ok(export_to_backup(self.datadir(), &dir)?),
            None => Ok(0),
        }
    }

    // === Git ===

    pub fn git_settings(&self) -> GitSettings {
        GitSettings::from_scope(&self.global())
    }

    /// Whether a save or a cluster asked for a push since the last one.
    pub fn push_requested(&self) -> bool {
        self.needs_push.load(Ordering::SeqCst)
            || self.clusters().iter().any(|c| c.needs_git_push())
            || self.git.has_pending_push()
    }

    /// Push when a save changed something or a cluster raised its flag.
    pub fn push_if_needed(&self) -> Result<bool, FleetError> {
        let mut changed = self.needs_push.swap(false, Ordering::SeqCst);
        for cluster in self.clusters() {
            if cluster.needs_git_push() {
                changed = true;
                cluster.clear_git_push();
            }
        }
        Ok(self.git.push_if_needed(&self.git_settings(), changed)?)
    }

    pub fn pull_tenant_if_due(&self, now: Instant) -> Option<TenantUpdate> {
        self.git.pull_tenant_if_due(&self.git_settings(), now)
    }

    /// Refresh and rotate the git token when due, then hot-swap it into the
    /// global scope and every cluster. Returns true when the token changed.
    pub fn refresh_git_token_if_due(&self, now: Instant) -> Result<bool, FleetError> {
        let Some(token) = self.git.refresh_if_due(&self.git_settings(), now)? else {
            return Ok(false);
        };
        self.set_git_token(&token.access_token)?;
        if let Some(refresh) = token.refresh_token {
            let mut global = self.global();
            replace_secret(&mut global, SettingId::OAuthRefreshToken, &refresh)?;
        }
        Ok(true)
    }

    /// Replace the git access token everywhere. The previous token becomes
    /// the secrets' old value.
    pub fn set_git_token(&self, token: &str) -> Result<(), FleetError> {
        {
            let mut global = self.global();
            replace_secret(&mut global, SettingId::GitAccessToken, token)?;
        }
        for cluster in self.clusters() {
            cluster.set_git_token(token)?;
        }
        info!("git access token hot-swapped");
        Ok(())
    }

    // === Arbitration ===

    /// Publish the split-brain flag to every cluster.
    pub fn set_split_brain(&self, split_brain: bool) {
        let mut state = lock(&self.state);
        state.split_brain = split_brain;
        for cluster in state.clusters.values() {
            cluster.set_split_brain(split_brain);
        }
    }

    /// One arbitration round. Peers are queried before the fleet lock is
    /// taken.
    pub fn arbitrate(&self) -> Option<RoundReport> {
        let report = self.arbitrator.round()?;
        self.set_split_brain(report.split_brain);
        Some(report)
    }

    /// Heartbeat document served to peers.
    pub fn heartbeat(&self) -> Heartbeat {
        let clusters = self.clusters();
        let names: Vec<String> = clusters.iter().map(|c| c.name().to_string()).collect();
        let hosts = clusters
            .iter()
            .map(|c| c.config().settings.db_hosts().len())
            .sum();
        self.arbitrator.heartbeat(&names, hosts, 0)
    }
}

/// Apply a runtime value to one scope. Pinned keys only get an audit entry.
fn apply_dynamic(
    scope: &mut ResolvedScope,
    handler: Handler,
    value: SettingValue,
    record: bool,
) -> Result<SetOutcome, FleetError> {
    let id = handler.id();
    if scope.snapshot.is_immutable(id) {
        if record {
            scope.snapshot.record_dynamic(id, value);
        }
        return Ok(SetOutcome::RecordedOnly);
    }
    if handler.is_secret() {
        scope.vault.set_plaintext(id, value.to_string())?;
    }
    handler.apply(&mut scope.settings, value.clone());
    if record {
        scope.snapshot.record_dynamic(id, value);
    }
    Ok(SetOutcome::Applied)
}

fn apply_static(scope: &mut ResolvedScope, handler: Handler, value: SettingValue) -> Result<(), FleetError> {
    if handler.is_secret() {
        scope.vault.set_plaintext(handler.id(), value.to_string())?;
    }
    scope.snapshot.dynamic.remove(&handler.id());
    handler.apply(&mut scope.settings, value);
    Ok(())
}

fn replace_secret(scope: &mut ResolvedScope, id: SettingId, plaintext: &str) -> Result<(), VaultError> {
    scope.vault.set_plaintext(id, plaintext)?;
    let value = SettingValue::Str(plaintext.to_string());
    scope.settings.set(id, value.clone());
    if scope.snapshot.is_immutable(id) {
        scope.snapshot.record_immutable(id, value);
    } else if id.scope() == SettingScope::Server {
        scope.snapshot.record_dynamic(id, value);
    }
    Ok(())
}

fn load_key(datadir: &Path) -> EncryptionKey {
    let path = datadir.join(KEY_FILE_NAME);
    match EncryptionKey::load_or_generate(&path) {
        Ok((key, KeyOrigin::Replaced)) => {
            warn!(path = %path.display(), "encryption key was unreadable and has been replaced");
            key
        }
        Ok((key, origin)) => {
            debug!(path = %path.display(), origin = ?origin, "encryption key ready");
            key
        }
        Err(e) => {
            warn!(
                path = %path.display(),
                error = %e,
                "cannot store encryption key, using an ephemeral key; encrypted values must be re-entered after restart"
            );
            EncryptionKey::generate()
        }
    }
}

fn http_heartbeat(ticker_secs: u64) -> Arc<dyn HeartbeatClient> {
    match HttpHeartbeatClient::new(heartbeat_timeout(ticker_secs)) {
        Ok(client) => Arc::new(client),
        Err(e) => {
            warn!(error = %e, "heartbeat client unavailable, peers will be reported unreachable");
            Arc::new(UnreachablePeers)
        }
    }
}

/// Stand-in when no HTTP client can be built: every peer is unknown.
struct UnreachablePeers;

impl HeartbeatClient for UnreachablePeers {
    fn fetch(&self, peer: &str) -> Result<Heartbeat, PeerError> {
        Err(PeerError::Unreachable {
            peer: peer.to_string(),
            reason: "no HTTP client".to_string(),
        })
    }
}
