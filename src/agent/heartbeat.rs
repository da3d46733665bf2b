//! Heartbeat signal emitted by the runtime.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::agent::state::AgentStatus;
use crate::error::RpcError;

/// Event type used when a heartbeat is reported to the kernel.
pub const HEARTBEAT_EVENT: &str = "AgentHeartbeat";

/// One heartbeat tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub agent_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub status: AgentStatus,
    pub task_count: u64,
}

impl Heartbeat {
    /// Payload submitted with the heartbeat event.
    pub fn payload(&self) -> serde_json::Value {
        serde_json::json!({
            "timestamp": self.timestamp.to_rfc3339(),
            "status": self.status,
            "task_count": self.task_count,
        })
    }
}

/// Destination for heartbeats.
///
/// Delivery failures are logged by the heartbeat loop and never stop it.
#[async_trait]
pub trait HeartbeatSink: Send + Sync {
    async fn send_heartbeat(&self, heartbeat: &Heartbeat) -> Result<(), RpcError>;
}
