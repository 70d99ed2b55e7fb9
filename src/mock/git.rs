//! Git and OAuth mocks.

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use super::lock;
use crate::git::{GitAuth, GitBackend, GitError, OAuthClient, OAuthCredentials, TokenGrant};

/// A recorded repository operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GitCall {
    Pull { url: String, dir: PathBuf, token: String },
    Push { url: String, dir: PathBuf, token: String, message: String },
}

/// Git backend that records calls instead of running git.
#[derive(Debug, Default)]
pub struct MockGitBackend {
    calls: Mutex<Vec<GitCall>>,
    pull_failure: Mutex<Option<GitError>>,
    push_failure: Mutex<Option<GitError>>,
    push_delay: Mutex<Option<Duration>>,
}

impl MockGitBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next pull with `error`.
    pub fn fail_next_pull(&self, error: GitError) {
        *lock(&self.pull_failure) = Some(error);
    }

    /// Fail the next push with `error`.
    pub fn fail_next_push(&self, error: GitError) {
        *lock(&self.push_failure) = Some(error);
    }

    /// Make every push take at least `delay`.
    pub fn set_push_delay(&self, delay: Duration) {
        *lock(&self.push_delay) = Some(delay);
    }

    pub fn calls(&self) -> Vec<GitCall> {
        lock(&self.calls).clone()
    }

    pub fn pushes(&self) -> usize {
        lock(&self.calls)
            .iter()
            .filter(|c| matches!(c, GitCall::Push { .. }))
            .count()
    }
}

impl GitBackend for MockGitBackend {
    fn clone_or_pull(&self, url: &str, dir: &Path, auth: &GitAuth) -> Result<(), GitError> {
        lock(&self.calls).push(GitCall::Pull {
            url: url.to_string(),
            dir: dir.to_path_buf(),
            token: auth.token.clone(),
        });
        match lock(&self.pull_failure).take() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn commit_and_push(
        &self,
        url: &str,
        dir: &Path,
        auth: &GitAuth,
        message: &str,
    ) -> Result<(), GitError> {
        let delay = *lock(&self.push_delay);
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        lock(&self.calls).push(GitCall::Push {
            url: url.to_string(),
            dir: dir.to_path_buf(),
            token: auth.token.clone(),
            message: message.to_string(),
        });
        match lock(&self.push_failure).take() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

/// OAuth provider returning scripted tokens.
#[derive(Debug, Default)]
pub struct MockOAuth {
    grant: Mutex<Option<(String, Option<String>)>>,
    rotated: Mutex<Option<String>>,
    refresh_failure: Mutex<Option<GitError>>,
    refreshed_with: Mutex<Vec<String>>,
    rotated_with: Mutex<Vec<String>>,
}

impl MockOAuth {
    pub fn new() -> Self {
        Self::default()
    }

    /// Access and refresh token returned by the next refreshes.
    pub fn grant(&self, access_token: &str, refresh_token: Option<&str>) {
        *lock(&self.grant) = Some((access_token.to_string(), refresh_token.map(str::to_string)));
    }

    /// Personal access token returned by rotation.
    pub fn rotate_to(&self, token: &str) {
        *lock(&self.rotated) = Some(token.to_string());
    }

    pub fn fail_refresh(&self, error: GitError) {
        *lock(&self.refresh_failure) = Some(error);
    }

    /// Refresh tokens presented so far.
    pub fn refreshed_with(&self) -> Vec<String> {
        lock(&self.refreshed_with).clone()
    }

    /// Access tokens used for rotation so far.
    pub fn rotated_with(&self) -> Vec<String> {
        lock(&self.rotated_with).clone()
    }
}

impl OAuthClient for MockOAuth {
    fn refresh_access_token(
        &self,
        _credentials: &OAuthCredentials,
        refresh_token: &str,
    ) -> Result<TokenGrant, GitError> {
        lock(&self.refreshed_with).push(refresh_token.to_string());
        if let Some(error) = lock(&self.refresh_failure).take() {
            return Err(error);
        }
        let (access_token, refresh_token) = lock(&self.grant)
            .clone()
            .ok_or_else(|| GitError::Http("no grant scripted".to_string()))?;
        Ok(TokenGrant {
            access_token,
            refresh_token,
            expires_in: Some(7200),
        })
    }

    fn rotate_personal_token(
        &self,
        _credentials: &OAuthCredentials,
        access_token: &str,
    ) -> Result<String, GitError> {
        lock(&self.rotated_with).push(access_token.to_string());
        lock(&self.rotated)
            .clone()
            .ok_or_else(|| GitError::Http("no rotation scripted".to_string()))
    }
}
