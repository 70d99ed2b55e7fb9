//! Git repository operations.
//!
//! `GitCli` drives the `git` binary. Credentials travel as an HTTP basic
//! auth header passed with `-c http.extraHeader`, so the token never lands
//! in the remote URL or `.git/config`.

use base64::Engine;
use std::path::Path;
use std::process::{Command, Output};
use tracing::debug;

use super::GitError;

/// Commit message used for configuration updates.
pub const COMMIT_MESSAGE: &str = "Update config";

/// Credentials for the remote.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct GitAuth {
    pub username: String,
    pub token: String,
}

impl std::fmt::Debug for GitAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GitAuth")
            .field("username", &self.username)
            .field("token", &"[REDACTED]")
            .finish()
    }
}

impl GitAuth {
    /// `Authorization` header value.
    pub fn header(&self) -> String {
        let user = if self.username.is_empty() {
            "oauth2"
        } else {
            self.username.as_str()
        };
        let encoded = base64::engine::general_purpose::STANDARD
            .encode(format!("{}:{}", user, self.token));
        format!("Authorization: Basic {}", encoded)
    }
}

/// Repository operations used by git distribution.
pub trait GitBackend: Send + Sync {
    /// Clone `url` into `dir`, or pull when `dir` is already a repository.
    fn clone_or_pull(&self, url: &str, dir: &Path, auth: &GitAuth) -> Result<(), GitError>;

    /// Stage everything under `dir`, commit, and push to `url`.
    fn commit_and_push(
        &self,
        url: &str,
        dir: &Path,
        auth: &GitAuth,
        message: &str,
    ) -> Result<(), GitError>;
}

/// Git backend that shells out to the `git` binary.
#[derive(Debug, Clone)]
pub struct GitCli {
    program: String,
}

impl Default for GitCli {
    fn default() -> Self {
        Self::new("git")
    }
}

impl GitCli {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn run(&self, dir: &Path, auth: Option<&GitAuth>, args: &[&str]) -> Result<Output, GitError> {
        let mut command = Command::new(&self.program);
        command
            .arg("-C")
            .arg(dir)
            .args(["-c", "user.name=fleet-control"])
            .args(["-c", "user.email=fleet-control@localhost"]);
        if let Some(auth) = auth {
            command.arg("-c").arg(format!("http.extraHeader={}", auth.header()));
        }
        command.args(args).env("GIT_TERMINAL_PROMPT", "0");

        debug!(dir = %dir.display(), args = ?args, "running git");
        let output = command
            .output()
            .map_err(|e| GitError::Command(format!("failed to spawn {}: {}", self.program, e)))?;
        Ok(output)
    }

    fn check(&self, dir: &Path, auth: Option<&GitAuth>, args: &[&str]) -> Result<Output, GitError> {
        let output = self.run(dir, auth, args)?;
        if output.status.success() {
            return Ok(output);
        }
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        Err(classify_failure(&args.join(" "), &stderr))
    }

    fn ensure_repository(&self, url: &str, dir: &Path) -> Result<(), GitError> {
        if dir.join(".git").is_dir() {
            return Ok(());
        }
        std::fs::create_dir_all(dir)?;
        self.check(dir, None, &["init", "-q"])?;
        self.check(dir, None, &["remote", "add", "origin", url])?;
        Ok(())
    }
}

impl GitBackend for GitCli {
    fn clone_or_pull(&self, url: &str, dir: &Path, auth: &GitAuth) -> Result<(), GitError> {
        self.ensure_repository(url, dir)?;
        match self.check(dir, Some(auth), &["pull", "-q", "origin", "HEAD"]) {
            // An empty remote has no HEAD yet.
            Err(GitError::Command(msg)) if msg.contains("couldn't find remote ref") => Ok(()),
            other => other.map(|_| ()),
        }
    }

    fn commit_and_push(
        &self,
        url: &str,
        dir: &Path,
        auth: &GitAuth,
        message: &str,
    ) -> Result<(), GitError> {
        self.ensure_repository(url, dir)?;
        self.check(dir, None, &["add", "-A"])?;

        let commit = self.run(dir, None, &["commit", "-q", "-m", message])?;
        if !commit.status.success() {
            let stdout = String::from_utf8_lossy(&commit.stdout);
            if !stdout.contains("nothing to commit") {
                let stderr = String::from_utf8_lossy(&commit.stderr).to_string();
                return Err(classify_failure("commit", &stderr));
            }
        }

        self.check(dir, Some(auth), &["push", "-q", "origin", "HEAD"])?;
        Ok(())
    }
}

/// Map git stderr onto the error conditions callers react to.
pub fn classify_failure(operation: &str, stderr: &str) -> GitError {
    let lower = stderr.to_ascii_lowercase();
    if lower.contains("repository not found")
        || lower.contains("does not appear to be a git repository")
        || lower.contains("not a git repository")
    {
        GitError::RepositoryNotFound(stderr.trim().to_string())
    } else if lower.contains("authentication failed")
        || lower.contains("http basic: access denied")
        || lower.contains("403")
        || lower.contains("401")
    {
        GitError::Auth(stderr.trim().to_string())
    } else {
        GitError::Command(format!("git {} failed: {}", operation, stderr.trim()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_header() {
        let auth = GitAuth {
            username: "bob".into(),
            token: "tok".into(),
        };
        assert_eq!(auth.header(), "Authorization: Basic Ym9iOnRvaw==");
        assert!(!format!("{:?}", auth).contains("tok\""));
    }

    #[test]
    fn test_classify_failure() {
        assert!(matches!(
            classify_failure("pull", "remote: Repository not found.\nfatal: ..."),
            GitError::RepositoryNotFound(_)
        ));
        assert!(matches!(
            classify_failure("push", "fatal: Authentication failed for 'https://x'"),
            GitError::Auth(_)
        ));
        assert!(matches!(
            classify_failure("push", "fatal: unable to access"),
            GitError::Command(_)
        ));
    }
}
