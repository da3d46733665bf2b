//! Agent identity, status and counters.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Agent type.
///
/// Informational only; the dispatch algorithm is the same for every type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentType {
    Reactive,
    Deliberative,
    Hybrid,
}

impl AgentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentType::Reactive => "reactive",
            AgentType::Deliberative => "deliberative",
            AgentType::Hybrid => "hybrid",
        }
    }
}

impl FromStr for AgentType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "reactive" => Ok(AgentType::Reactive),
            "deliberative" => Ok(AgentType::Deliberative),
            "hybrid" => Ok(AgentType::Hybrid),
            other => Err(format!(
                "unknown agent type '{}', expected reactive, deliberative or hybrid",
                other
            )),
        }
    }
}

impl std::fmt::Display for AgentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Lifecycle status of the agent.
///
/// ```text
/// idle ──dequeue──▶ executing ──finalize──▶ idle
///   any ──internal failure──▶ error (sticky until reset)
/// ```
///
/// `Planning` and `Waiting` are never entered by the dispatch loop; they are
/// available to extensions through [`AgentRuntime::set_status`].
///
/// [`AgentRuntime::set_status`]: crate::agent::AgentRuntime::set_status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Idle,
    Planning,
    Executing,
    Waiting,
    Error,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Idle => "idle",
            AgentStatus::Planning => "planning",
            AgentStatus::Executing => "executing",
            AgentStatus::Waiting => "waiting",
            AgentStatus::Error => "error",
        }
    }
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Health of the agent. The runtime never changes it on its own; callers
/// set it with `AgentRuntime::set_health`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentHealth {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Mutable agent fields, guarded by the runtime's state lock.
#[derive(Debug, Clone)]
pub(crate) struct AgentState {
    pub status: AgentStatus,
    pub health: AgentHealth,
    /// Tasks currently executing, in start order.
    pub in_flight: Vec<Uuid>,
    pub task_count: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Free-form state merged in by external collaborators.
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Default for AgentState {
    fn default() -> Self {
        Self {
            status: AgentStatus::Idle,
            health: AgentHealth::Healthy,
            in_flight: Vec::new(),
            task_count: 0,
            success_count: 0,
            failure_count: 0,
            last_heartbeat: None,
            last_error: None,
            extra: serde_json::Map::new(),
        }
    }
}

/// Point-in-time view of the agent, suitable for checkpointing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSnapshot {
    pub id: Uuid,
    pub name: String,
    #[serde(rename = "type")]
    pub agent_type: AgentType,
    pub status: AgentStatus,
    pub health: AgentHealth,
    pub task_count: u64,
    pub success_count: u64,
    pub failure_count: u64,
    /// The oldest task still executing, if any.
    pub current_task: Option<Uuid>,
    pub in_flight: usize,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    #[serde(default)]
    pub state: serde_json::Map<String, serde_json::Value>,
}

impl AgentState {
    pub fn snapshot(&self, id: Uuid, name: &str, agent_type: AgentType) -> AgentSnapshot {
        AgentSnapshot {
            id,
            name: name.to_string(),
            agent_type,
            status: self.status,
            health: self.health,
            task_count: self.task_count,
            success_count: self.success_count,
            failure_count: self.failure_count,
            current_task: self.in_flight.first().copied(),
            in_flight: self.in_flight.len(),
            last_heartbeat: self.last_heartbeat,
            last_error: self.last_error.clone(),
            state: self.extra.clone(),
        }
    }
}
