//! Kernel wire types.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::RpcError;

pub const KERNEL_STATUS: &str = "kernel.status";
pub const KERNEL_PAUSE: &str = "kernel.pause";
pub const KERNEL_RESUME: &str = "kernel.resume";
pub const KERNEL_SHUTDOWN: &str = "kernel.shutdown";
pub const EVENT_SUBMIT: &str = "event.submit";
pub const TASK_SUBMIT: &str = "task.submit";
pub const TASK_STATUS: &str = "task.status";
pub const TASK_CANCEL: &str = "task.cancel";
pub const CAPABILITY_GRANT: &str = "capability.grant";
pub const CAPABILITY_CHECK: &str = "capability.check";
pub const RESOURCE_MEMORY: &str = "resource.memory";
pub const MEMORY_STORE: &str = "memory.store";
pub const MEMORY_GET: &str = "memory.get";
pub const CHECKPOINT_CREATE: &str = "checkpoint.create";
pub const CHECKPOINT_RESTORE: &str = "checkpoint.restore";

/// Pushed event carrying a task for the agent.
pub const TASK_REQUESTED_EVENT: &str = "TaskRequested";

/// Request to the kernel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    /// Always an object; `{}` when the method takes nothing.
    #[serde(default = "empty_params")]
    pub params: serde_json::Value,
}

fn empty_params() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

impl RpcRequest {
    pub fn new(id: u64, method: impl Into<String>, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            method: method.into(),
            params: params.unwrap_or_else(empty_params),
        }
    }
}

/// Response from the kernel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    #[serde(default)]
    pub jsonrpc: Option<String>,
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcErrorBody>,
}

/// Error reported by the kernel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcErrorBody {
    #[serde(default = "default_error_message")]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

fn default_error_message() -> String {
    "RPC error".to_string()
}

impl RpcResponse {
    pub fn success(id: u64, result: serde_json::Value) -> Self {
        Self {
            jsonrpc: Some("2.0".to_string()),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: u64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: Some("2.0".to_string()),
            id,
            result: None,
            error: Some(RpcErrorBody {
                message: message.into(),
                code: None,
                data: None,
            }),
        }
    }

    /// The result, or the kernel's error as [`RpcError::Remote`]. A missing
    /// result is `null`.
    pub fn into_result(self) -> Result<serde_json::Value, RpcError> {
        match self.error {
            Some(error) => Err(RpcError::Remote {
                message: error.message,
            }),
            None => Ok(self.result.unwrap_or(serde_json::Value::Null)),
        }
    }
}

/// Frame that registers interest in one event type on the push feed.
pub fn subscribe_frame(event_type: &str) -> serde_json::Value {
    serde_json::json!({
        "type": "subscribe",
        "event_type": event_type,
    })
}

/// `event_type` of a pushed frame, if it has one.
pub fn frame_event_type(frame: &serde_json::Value) -> Option<&str> {
    frame.get("event_type").and_then(|v| v.as_str())
}

/// An event as the kernel pushes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelEvent {
    #[serde(default)]
    pub id: Option<String>,
    pub event_type: String,
    #[serde(default)]
    pub source_id: Option<String>,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

/// `kernel.status` result. Fields the kernel adds beyond these land in
/// `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelStatus {
    pub state: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub uptime_secs: Option<u64>,
    #[serde(default)]
    pub policy_mode: Option<String>,
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}
