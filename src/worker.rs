//! WorkerRecord: the registry's per-worker state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::capability::CapabilityDefinition;

/// A registered worker and the capabilities it advertises.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerRecord {
    pub worker_id: String,
    pub worker_url: String,
    pub capabilities: Vec<CapabilityDefinition>,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peer_identity: Option<String>,
}

impl WorkerRecord {
    pub fn new(
        worker_id: String,
        worker_url: String,
        capabilities: Vec<CapabilityDefinition>,
        peer_identity: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            worker_id,
            worker_url,
            capabilities,
            registered_at: now,
            last_heartbeat_at: now,
            peer_identity,
        }
    }

    /// `now - last_heartbeat_at < stale_timeout`.
    pub fn is_healthy(&self, now: DateTime<Utc>, stale_timeout: chrono::Duration) -> bool {
        now - self.last_heartbeat_at < stale_timeout
    }
}
