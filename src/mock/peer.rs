//! Scripted peer heartbeats.

use std::collections::HashMap;
use std::sync::Mutex;

use super::lock;
use crate::arbitration::{Heartbeat, HeartbeatClient, PeerError};

/// Heartbeat client answering from a per-peer script. Peers without a
/// script are unreachable.
#[derive(Debug, Default)]
pub struct MockPeers {
    responses: Mutex<HashMap<String, Option<Heartbeat>>>,
    requests: Mutex<Vec<String>>,
}

impl MockPeers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(&self, peer: &str, heartbeat: Heartbeat) {
        lock(&self.responses).insert(peer.to_string(), Some(heartbeat));
    }

    pub fn unreachable(&self, peer: &str) {
        lock(&self.responses).insert(peer.to_string(), None);
    }

    /// Peers queried so far, in order.
    pub fn requests(&self) -> Vec<String> {
        lock(&self.requests).clone()
    }
}

impl HeartbeatClient for MockPeers {
    fn fetch(&self, peer: &str) -> Result<Heartbeat, PeerError> {
        lock(&self.requests).push(peer.to_string());
        match lock(&self.responses).get(peer) {
            Some(Some(heartbeat)) => Ok(heartbeat.clone()),
            _ => Err(PeerError::Unreachable {
                peer: peer.to_string(),
                reason: "operation timed out".to_string(),
            }),
        }
    }
}
