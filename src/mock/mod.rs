//! Scripted collaborators for tests.
//!
//! - `MockGitBackend`: records pulls and pushes, injects failures
//! - `MockOAuth`: scripted token grants and rotations
//! - `MockPeers`: per-peer heartbeat responses

mod git;
mod peer;

pub use git::{GitCall, MockGitBackend, MockOAuth};
pub use peer::MockPeers;

use std::sync::{Mutex, MutexGuard};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
