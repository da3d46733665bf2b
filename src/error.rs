//! Error types for the agent runtime.

use std::time::Duration;

/// Top-level error type for the agent.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Kernel error: {0}")]
    Rpc(#[from] RpcError),

    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("Tool gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("Memory error: {0}")]
    Memory(#[from] MemoryError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to read config file {path}: {reason}")]
    Read { path: String, reason: String },

    #[error("Failed to parse config: {0}")]
    Parse(String),
}

/// Errors from the kernel RPC channel.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Not connected to kernel")]
    NotConnected,

    #[error("RPC error: {message}")]
    Remote { message: String },

    #[error("RPC call {method} timed out after {timeout:?}")]
    Timeout { method: String, timeout: Duration },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Channel closed")]
    Closed,
}

/// Errors raised by the scheduler.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("Task queue is closed")]
    QueueClosed,

    #[error("No handler for task type: {task_type}")]
    NoHandler { task_type: String },

    #[error("Task timed out after {}ms", timeout.as_millis())]
    TaskTimeout { timeout: Duration },

    #[error("Agent is already running")]
    AlreadyRunning,

    #[error("Task {task_id} exhausted its {max_retries} retries")]
    RetriesExhausted { task_id: String, max_retries: u32 },

    #[error("Task {task_id} is {status} and cannot be retried")]
    NotRetryable { task_id: String, status: String },
}

/// Error returned by a task handler.
///
/// The `Display` output is what gets recorded as the task's `error`.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("{0}")]
    Failed(String),

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Task handler panicked: {0}")]
    Panicked(String),

    #[error(transparent)]
    Memory(#[from] MemoryError),

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error(transparent)]
    Rpc(#[from] RpcError),
}

impl TaskError {
    /// Create a plain failure with the given message.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// Tool gateway errors.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("Unknown tool: {name}")]
    UnknownTool { name: String },

    #[error("Unsupported {kind}: {name}")]
    Unsupported { kind: &'static str, name: String },
}

/// Memory store errors.
#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    #[error("Embedding failed: {reason}")]
    Embedding { reason: String },

    #[error("Embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Storage error: {reason}")]
    Storage { reason: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type alias for the agent.
pub type Result<T> = std::result::Result<T, Error>;
