//! Git distribution of the working directory.
//!
//! Pull on start, push when a save changed something, tenant files from a
//! second repository, and OAuth-driven token rotation.

mod gate;
mod oauth;
mod repo;
mod tenant;

pub use gate::{GateOutcome, SaveGate};
pub use oauth::{token_error, GitLabOAuth, OAuthClient, OAuthCredentials, TokenGrant};
pub use repo::{classify_failure, GitAuth, GitBackend, GitCli, COMMIT_MESSAGE};
pub use tenant::{ensure_gitignore, TenantFiles, TenantUpdate, PULL_DIR};

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use fleet_settings::SettingId;

use crate::config::ResolvedScope;

/// Git distribution errors.
#[derive(Debug, Error)]
pub enum GitError {
    /// The OAuth refresh token was revoked or expired.
    #[error("invalid grant: {0}")]
    InvalidGrant(String),

    #[error("repository not found: {0}")]
    RepositoryNotFound(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("{0}")]
    Command(String),

    #[error("http error: {0}")]
    Http(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Git-related settings of the global scope, secrets in plaintext.
#[derive(Clone, Default)]
pub struct GitSettings {
    pub url: Option<String>,
    pub url_pull: Option<String>,
    pub auth: GitAuth,
    pub oauth: OAuthCredentials,
    pub refresh_token: String,
    pub refresh_interval: Duration,
    pub pull_interval: Duration,
}

impl std::fmt::Debug for GitSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GitSettings")
            .field("url", &self.url)
            .field("url_pull", &self.url_pull)
            .field("auth", &self.auth)
            .field("refresh_interval", &self.refresh_interval)
            .field("pull_interval", &self.pull_interval)
            .finish_non_exhaustive()
    }
}

impl GitSettings {
    pub fn from_scope(scope: &ResolvedScope) -> Self {
        let settings = &scope.settings;
        let secret = |id: SettingId| {
            scope
                .vault
                .decrypted(id)
                .unwrap_or_else(|| settings.str(id).to_string())
        };
        Self {
            url: settings.git_url().map(str::to_string),
            url_pull: settings.git_url_pull().map(str::to_string),
            auth: GitAuth {
                username: settings.str(SettingId::GitUsername).to_string(),
                token: secret(SettingId::GitAccessToken),
            },
            oauth: OAuthCredentials {
                provider_url: settings.str(SettingId::OAuthProviderUrl).to_string(),
                client_id: settings.str(SettingId::OAuthClientId).to_string(),
                client_secret: secret(SettingId::OAuthClientSecret),
            },
            refresh_token: secret(SettingId::OAuthRefreshToken),
            refresh_interval: Duration::from_secs(settings.token_refresh_seconds()),
            pull_interval: Duration::from_secs(settings.git_monitoring_ticker()),
        }
    }

    /// A remote and a token are both configured.
    pub fn push_enabled(&self) -> bool {
        self.url.is_some() && !self.auth.token.is_empty()
    }

    pub fn refresh_enabled(&self) -> bool {
        !self.oauth.client_id.is_empty() && !self.refresh_token.is_empty()
    }
}

/// Tokens produced by one refresh cycle.
#[derive(Clone, PartialEq, Eq)]
pub struct RefreshedToken {
    /// New personal access token used for git operations.
    pub access_token: String,
    /// Replacement refresh token, when the provider issued one.
    pub refresh_token: Option<String>,
}

impl std::fmt::Debug for RefreshedToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefreshedToken")
            .field("refresh_token_rotated", &self.refresh_token.is_some())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default)]
struct Schedule {
    last_refresh: Option<Instant>,
    last_pull: Option<Instant>,
}

/// Pushes and pulls the working directory.
pub struct GitSync {
    backend: Arc<dyn GitBackend>,
    oauth: Arc<dyn OAuthClient>,
    datadir: PathBuf,
    started: Instant,
    push_gate: SaveGate,
    /// Serializes every repository operation so push and pull never overlap.
    repo_lock: Mutex<()>,
    pending_push: AtomicBool,
    tenant: Mutex<TenantFiles>,
    schedule: Mutex<Schedule>,
}

impl std::fmt::Debug for GitSync {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GitSync")
            .field("datadir", &self.datadir)
            .field("pending_push", &self.pending_push.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl GitSync {
    pub fn new(backend: Arc<dyn GitBackend>, oauth: Arc<dyn OAuthClient>, datadir: impl Into<PathBuf>) -> Self {
        Self {
            backend,
            oauth,
            datadir: datadir.into(),
            started: Instant::now(),
            push_gate: SaveGate::new(),
            repo_lock: Mutex::new(()),
            pending_push: AtomicBool::new(false),
            tenant: Mutex::new(TenantFiles::new()),
            schedule: Mutex::new(Schedule::default()),
        }
    }

    pub fn datadir(&self) -> &Path {
        &self.datadir
    }

    fn pull_dir(&self) -> PathBuf {
        self.datadir.join(PULL_DIR)
    }

    /// A previous push failed and has not been retried successfully yet.
    pub fn has_pending_push(&self) -> bool {
        self.pending_push.load(Ordering::SeqCst)
    }

    /// Bring the working directory up to date before configuration is
    /// resolved. Tenant pull failures are logged, not returned.
    pub fn pull_on_start(&self, git: &GitSettings) -> Result<(), GitError> {
        if let Some(url) = git.url.as_deref().filter(|_| git.push_enabled()) {
            let _guard = lock(&self.repo_lock);
            info!(url = %url, dir = %self.datadir.display(), "pulling configuration repository");
            self.backend.clone_or_pull(url, &self.datadir, &git.auth)?;
        }
        if git.url_pull.is_some() {
            if let Err(e) = self.pull_tenant(git, Instant::now()) {
                warn!(error = %e, "tenant pull failed");
            }
        }
        Ok(())
    }

    /// Pull the tenant repository into `.pull/` and reload changed files.
    pub fn pull_tenant(&self, git: &GitSettings, now: Instant) -> Result<TenantUpdate, GitError> {
        lock(&self.schedule).last_pull = Some(now);
        let Some(url) = git.url_pull.as_deref() else {
            return Ok(TenantUpdate::default());
        };
        let dir = self.pull_dir();
        {
            let _guard = lock(&self.repo_lock);
            match self.backend.clone_or_pull(url, &dir, &git.auth) {
                Err(GitError::RepositoryNotFound(reason)) => {
                    warn!(reason = %reason, dir = %dir.display(), "tenant repository broken, recloning");
                    remove_dir_if_exists(&dir.join(".git"))?;
                    self.backend.clone_or_pull(url, &dir, &git.auth)?;
                }
                other => other?,
            }
        }
        Ok(lock(&self.tenant).reload(&dir))
    }

    /// Pull the tenant repository when `git-monitoring-ticker` elapsed.
    pub fn pull_tenant_if_due(&self, git: &GitSettings, now: Instant) -> Option<TenantUpdate> {
        git.url_pull.as_ref()?;
        let last = lock(&self.schedule).last_pull.unwrap_or(self.started);
        if now.saturating_duration_since(last) < git.pull_interval {
            return None;
        }
        match self.pull_tenant(git, now) {
            Ok(update) => Some(update),
            Err(e) => {
                warn!(error = %e, "tenant pull failed");
                None
            }
        }
    }

    /// Snapshot of the last loaded tenant files.
    pub fn tenant(&self) -> TenantFiles {
        lock(&self.tenant).clone()
    }

    /// Commit and push the working directory when `changed` or when an
    /// earlier push failed. Returns true when this call ran a push.
    ///
    /// Requests arriving during a push are folded into one follow-up push.
    pub fn push_if_needed(&self, git: &GitSettings, changed: bool) -> Result<bool, GitError> {
        if !changed && !self.has_pending_push() {
            return Ok(false);
        }
        let Some(url) = git.url.as_deref().filter(|_| git.push_enabled()) else {
            return Ok(false);
        };

        let mut result = Ok(());
        let outcome = self.push_gate.run(|| {
            result = self.push(url, &git.auth);
        });
        match (outcome, result) {
            (GateOutcome::Queued, _) => {
                debug!("push already running, request queued");
                Ok(false)
            }
            (GateOutcome::Ran, Ok(())) => {
                self.pending_push.store(false, Ordering::SeqCst);
                Ok(true)
            }
            (GateOutcome::Ran, Err(e)) => {
                self.pending_push.store(true, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    fn push(&self, url: &str, auth: &GitAuth) -> Result<(), GitError> {
        let _guard = lock(&self.repo_lock);
        ensure_gitignore(&self.datadir)?;
        match self
            .backend
            .commit_and_push(url, &self.datadir, auth, COMMIT_MESSAGE)
        {
            Err(GitError::RepositoryNotFound(reason)) => {
                warn!(reason = %reason, "repository missing, reinitializing before retry");
                remove_dir_if_exists(&self.datadir.join(".git"))?;
                self.backend
                    .commit_and_push(url, &self.datadir, auth, COMMIT_MESSAGE)?;
            }
            other => other?,
        }
        info!(url = %url, "configuration pushed");
        Ok(())
    }

    /// A refresh is configured and `git-token-refresh-seconds` elapsed since
    /// the last attempt (or since start).
    pub fn refresh_due(&self, git: &GitSettings, now: Instant) -> bool {
        if !git.refresh_enabled() {
            return false;
        }
        let last = lock(&self.schedule).last_refresh.unwrap_or(self.started);
        now.saturating_duration_since(last) >= git.refresh_interval
    }

    /// Exchange the refresh token, then rotate the personal access token.
    ///
    /// The attempt counts against the schedule whether it succeeds or not.
    pub fn refresh_token(&self, git: &GitSettings, now: Instant) -> Result<RefreshedToken, GitError> {
        lock(&self.schedule).last_refresh = Some(now);

        let grant = self
            .oauth
            .refresh_access_token(&git.oauth, &git.refresh_token)
            .map_err(|e| {
                match &e {
                    GitError::InvalidGrant(reason) => {
                        error!(reason = %reason, "refresh token rejected, re-authorization required")
                    }
                    other => warn!(error = %other, "token refresh failed"),
                }
                e
            })?;
        let access_token = self.oauth.rotate_personal_token(&git.oauth, &grant.access_token)?;
        info!(expires_in = ?grant.expires_in, "git access token rotated");

        Ok(RefreshedToken {
            access_token,
            refresh_token: grant.refresh_token.filter(|t| !t.is_empty()),
        })
    }

    pub fn refresh_if_due(&self, git: &GitSettings, now: Instant) -> Result<Option<RefreshedToken>, GitError> {
        if !self.refresh_due(git, now) {
            return Ok(None);
        }
        self.refresh_token(git, now).map(Some)
    }
}

fn remove_dir_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_dir_all(path) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{GitCall, MockGitBackend, MockOAuth};
    use tempfile::TempDir;

    fn settings() -> GitSettings {
        GitSettings {
            url: Some("https://git.example.com/fleet.git".into()),
            url_pull: None,
            auth: GitAuth {
                username: String::new(),
                token: "pat-1".into(),
            },
            oauth: OAuthCredentials {
                provider_url: "https://git.example.com".into(),
                client_id: "client".into(),
                client_secret: "secret".into(),
            },
            refresh_token: "refresh-1".into(),
            refresh_interval: Duration::from_secs(86400),
            pull_interval: Duration::from_secs(60),
        }
    }

    fn sync(dir: &TempDir, backend: Arc<MockGitBackend>, oauth: Arc<MockOAuth>) -> GitSync {
        GitSync::new(backend, oauth, dir.path())
    }

    // === Push Tests ===

    #[test]
    fn test_push_only_when_changed() {
        let dir = TempDir::new().unwrap();
        let backend = Arc::new(MockGitBackend::new());
        let git = sync(&dir, backend.clone(), Arc::new(MockOAuth::new()));

        assert!(!git.push_if_needed(&settings(), false).unwrap());
        assert!(git.push_if_needed(&settings(), true).unwrap());
        assert_eq!(backend.pushes(), 1);
        assert!(fs::read_to_string(dir.path().join(".gitignore"))
            .unwrap()
            .contains(".pull/"));
    }

    #[test]
    fn test_push_skipped_without_token() {
        let dir = TempDir::new().unwrap();
        let backend = Arc::new(MockGitBackend::new());
        let git = sync(&dir, backend.clone(), Arc::new(MockOAuth::new()));
        let mut cfg = settings();
        cfg.auth.token.clear();

        assert!(!git.push_if_needed(&cfg, true).unwrap());
        assert_eq!(backend.pushes(), 0);
    }

    #[test]
    fn test_missing_repository_reinitialized_once() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join(".git").join("objects")).unwrap();
        let backend = Arc::new(MockGitBackend::new());
        backend.fail_next_push(GitError::RepositoryNotFound("gone".into()));
        let git = sync(&dir, backend.clone(), Arc::new(MockOAuth::new()));

        assert!(git.push_if_needed(&settings(), true).unwrap());
        assert_eq!(backend.pushes(), 2);
        assert!(!dir.path().join(".git").exists());
    }

    #[test]
    fn test_failed_push_retried_next_tick() {
        let dir = TempDir::new().unwrap();
        let backend = Arc::new(MockGitBackend::new());
        backend.fail_next_push(GitError::Auth("denied".into()));
        let git = sync(&dir, backend.clone(), Arc::new(MockOAuth::new()));

        assert!(matches!(git.push_if_needed(&settings(), true), Err(GitError::Auth(_))));
        assert!(git.has_pending_push());

        assert!(git.push_if_needed(&settings(), false).unwrap());
        assert!(!git.has_pending_push());
    }

    // === Pull Tests ===

    #[test]
    fn test_pull_on_start_pulls_both_repositories() {
        let dir = TempDir::new().unwrap();
        let backend = Arc::new(MockGitBackend::new());
        let git = sync(&dir, backend.clone(), Arc::new(MockOAuth::new()));
        let mut cfg = settings();
        cfg.url_pull = Some("https://git.example.com/tenant.git".into());

        git.pull_on_start(&cfg).unwrap();
        let calls = backend.calls();
        assert_eq!(calls.len(), 2);
        assert!(matches!(&calls[0], GitCall::Pull { dir: d, .. } if d == dir.path()));
        assert!(matches!(&calls[1], GitCall::Pull { dir: d, .. } if d == &dir.path().join(PULL_DIR)));
    }

    #[test]
    fn test_tenant_pull_retries_after_removing_git_dir() {
        let dir = TempDir::new().unwrap();
        let pull_git = dir.path().join(PULL_DIR).join(".git");
        fs::create_dir_all(&pull_git).unwrap();
        let backend = Arc::new(MockGitBackend::new());
        backend.fail_next_pull(GitError::RepositoryNotFound("corrupt".into()));
        let git = sync(&dir, backend.clone(), Arc::new(MockOAuth::new()));
        let mut cfg = settings();
        cfg.url_pull = Some("https://git.example.com/tenant.git".into());

        git.pull_tenant(&cfg, Instant::now()).unwrap();
        assert_eq!(backend.calls().len(), 2);
        assert!(!pull_git.exists());
    }

    #[test]
    fn test_tenant_pull_follows_ticker() {
        let dir = TempDir::new().unwrap();
        let backend = Arc::new(MockGitBackend::new());
        let git = sync(&dir, backend.clone(), Arc::new(MockOAuth::new()));
        let mut cfg = settings();
        cfg.url_pull = Some("https://git.example.com/tenant.git".into());

        let start = Instant::now();
        assert!(git.pull_tenant_if_due(&cfg, start).is_none());
        assert!(git.pull_tenant_if_due(&cfg, start + Duration::from_secs(61)).is_some());
        assert!(git.pull_tenant_if_due(&cfg, start + Duration::from_secs(62)).is_none());
        assert_eq!(backend.calls().len(), 1);
    }

    // === Token Tests ===

    #[test]
    fn test_refresh_then_rotate() {
        let dir = TempDir::new().unwrap();
        let oauth = Arc::new(MockOAuth::new());
        oauth.grant("access-2", Some("refresh-2"));
        oauth.rotate_to("pat-2");
        let git = sync(&dir, Arc::new(MockGitBackend::new()), oauth.clone());

        let start = Instant::now();
        assert!(git.refresh_if_due(&settings(), start).unwrap().is_none());

        let later = start + Duration::from_secs(86400);
        let token = git.refresh_if_due(&settings(), later).unwrap().unwrap();
        assert_eq!(token.access_token, "pat-2");
        assert_eq!(token.refresh_token.as_deref(), Some("refresh-2"));
        assert_eq!(oauth.rotated_with(), vec!["access-2".to_string()]);
        assert!(!git.refresh_due(&settings(), later + Duration::from_secs(1)));
    }

    #[test]
    fn test_invalid_grant_surfaces_distinctly() {
        let dir = TempDir::new().unwrap();
        let oauth = Arc::new(MockOAuth::new());
        oauth.fail_refresh(GitError::InvalidGrant("revoked".into()));
        let git = sync(&dir, Arc::new(MockGitBackend::new()), oauth.clone());

        let result = git.refresh_token(&settings(), Instant::now());
        assert!(matches!(result, Err(GitError::InvalidGrant(_))));
        assert!(oauth.rotated_with().is_empty());
    }

    #[test]
    fn test_refresh_disabled_without_client() {
        let dir = TempDir::new().unwrap();
        let git = sync(&dir, Arc::new(MockGitBackend::new()), Arc::new(MockOAuth::new()));
        let mut cfg = settings();
        cfg.oauth.client_id.clear();
        assert!(!git.refresh_due(&cfg, Instant::now() + Duration::from_secs(200_000)));
    }
}
