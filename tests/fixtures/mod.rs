//! Shared fixtures: a temporary configuration file and working directory
//! wired to scripted collaborators.

#![allow(dead_code)]

use fleet_control::arbitration::HeartbeatClient;
use fleet_control::mock::{MockGitBackend, MockOAuth, MockPeers};
use fleet_control::{Collaborators, Fleet, SourceOptions};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

/// A fleet under test. Restarting reuses the same files and working
/// directory, key file included.
pub struct TestFleet {
    pub dir: TempDir,
    pub git: Arc<MockGitBackend>,
    pub oauth: Arc<MockOAuth>,
    pub peers: Arc<MockPeers>,
    pub overrides: Vec<(String, String)>,
}

impl TestFleet {
    pub fn new(config: &str) -> Self {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("fleet.toml"), config).unwrap();
        Self {
            dir,
            git: Arc::new(MockGitBackend::new()),
            oauth: Arc::new(MockOAuth::new()),
            peers: Arc::new(MockPeers::new()),
            overrides: Vec::new(),
        }
    }

    pub fn config_path(&self) -> PathBuf {
        self.dir.path().join("fleet.toml")
    }

    pub fn datadir(&self) -> PathBuf {
        self.dir.path().join("data")
    }

    /// Add a file to the include directory next to the main file.
    pub fn include(&self, name: &str, body: &str) {
        let dir = self.dir.path().join("cluster.d");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(name), body).unwrap();
    }

    pub fn options(&self) -> SourceOptions {
        SourceOptions {
            config_file: Some(self.config_path()),
            include_dir: None,
            datadir: Some(self.datadir()),
            clusters: Vec::new(),
            overrides: self.overrides.clone(),
        }
    }

    fn collaborators(&self) -> Collaborators {
        Collaborators {
            git: self.git.clone(),
            oauth: self.oauth.clone(),
            heartbeat: Some(self.peers.clone() as Arc<dyn HeartbeatClient>),
        }
    }

    /// Start without pulling from git.
    pub fn start(&self) -> Fleet {
        Fleet::init_config(&self.options(), false, self.collaborators()).unwrap()
    }

    pub fn start_with_git(&self) -> Fleet {
        Fleet::init_config(&self.options(), true, self.collaborators()).unwrap()
    }

    /// Contents of a file under the working directory.
    pub fn read(&self, rel: impl AsRef<Path>) -> String {
        fs::read_to_string(self.datadir().join(rel)).unwrap()
    }

    /// Every regular file under the working directory, concatenated.
    pub fn read_all(&self) -> String {
        let mut out = String::new();
        for entry in walkdir::WalkDir::new(self.datadir()) {
            let entry = entry.unwrap();
            if entry.file_type().is_file() {
                out.push_str(&fs::read_to_string(entry.path()).unwrap_or_default());
            }
        }
        out
    }
}
