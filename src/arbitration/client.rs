//! Heartbeat transport.

use std::time::Duration;
use thiserror::Error;

use super::heartbeat::{Heartbeat, HEARTBEAT_PATH};

/// Why a peer could not confirm its state.
#[derive(Debug, Error)]
pub enum PeerError {
    #[error("failed to create HTTP client: {0}")]
    Client(String),

    #[error("peer {peer} unreachable: {reason}")]
    Unreachable { peer: String, reason: String },

    #[error("peer {peer} returned status {status}")]
    Status { peer: String, status: u16 },

    #[error("peer {peer} sent an invalid heartbeat: {reason}")]
    Decode { peer: String, reason: String },
}

/// Fetches a peer's heartbeat.
pub trait HeartbeatClient: Send + Sync {
    fn fetch(&self, peer: &str) -> Result<Heartbeat, PeerError>;
}

/// Request timeout for a given monitoring tick.
pub fn heartbeat_timeout(ticker_secs: u64) -> Duration {
    Duration::from_secs(ticker_secs.max(1) * 4)
}

/// Plain HTTP heartbeat client.
#[derive(Debug, Clone)]
pub struct HttpHeartbeatClient {
    client: reqwest::blocking::Client,
}

impl HttpHeartbeatClient {
    pub fn new(timeout: Duration) -> Result<Self, PeerError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PeerError::Client(e.to_string()))?;
        Ok(Self { client })
    }
}

impl HeartbeatClient for HttpHeartbeatClient {
    fn fetch(&self, peer: &str) -> Result<Heartbeat, PeerError> {
        let url = format!("http://{}{}", peer, HEARTBEAT_PATH);
        let response = self.client.get(&url).send().map_err(|e| PeerError::Unreachable {
            peer: peer.to_string(),
            reason: e.to_string(),
        })?;
        let status = response.status();
        if !status.is_success() {
            return Err(PeerError::Status {
                peer: peer.to_string(),
                status: status.as_u16(),
            });
        }
        let body = response.bytes().map_err(|e| PeerError::Unreachable {
            peer: peer.to_string(),
            reason: e.to_string(),
        })?;
        serde_json::from_slice(&body).map_err(|e| PeerError::Decode {
            peer: peer.to_string(),
            reason: e.to_string(),
        })
    }
}
