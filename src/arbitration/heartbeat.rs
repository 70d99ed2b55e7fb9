//! Heartbeat document exchanged between peer monitors.

use serde::{Deserialize, Serialize};

/// Path peers serve their heartbeat on.
pub const HEARTBEAT_PATH: &str = "/api/heartbeat";

/// Status code of an active instance.
pub const STATUS_ACTIVE: &str = "A";
/// Status code of a standby instance.
pub const STATUS_STANDBY: &str = "S";

#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    #[serde(default)]
    pub uuid: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub secret: String,
    #[serde(default)]
    pub cluster: String,
    #[serde(default)]
    pub master: String,
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub hosts: usize,
    #[serde(default)]
    pub failed: usize,
}

impl std::fmt::Debug for Heartbeat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Heartbeat")
            .field("uuid", &self.uuid)
            .field("cluster", &self.cluster)
            .field("status", &self.status)
            .field("hosts", &self.hosts)
            .field("failed", &self.failed)
            .finish_non_exhaustive()
    }
}

impl Heartbeat {
    pub fn is_active(&self) -> bool {
        self.status == STATUS_ACTIVE
    }
}
