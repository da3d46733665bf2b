//! Task types for the dispatch loop.
//!
//! A task moves `pending → running → {completed, failed}`. Once it leaves
//! `running` exactly one of `result` / `error` is set.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::SchedulerError;

const DEFAULT_PRIORITY: i32 = 5;
const DEFAULT_TIMEOUT_MS: u64 = 300_000;
const DEFAULT_MAX_RETRIES: u32 = 3;

/// Task status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    /// Check if this status is final.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A unit of work submitted to the agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    /// Key used to look up the handler.
    pub task_type: String,
    /// Advisory only. The queue is strict FIFO.
    pub priority: i32,
    pub status: TaskStatus,
    pub payload: serde_json::Value,
    pub source_id: Option<String>,
    /// Advisory metadata; the scheduler does not order by dependencies.
    pub dependencies: Vec<Uuid>,
    pub timeout_ms: u64,
    pub retry_count: u32,
    pub max_retries: u32,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Create a pending task.
    pub fn new(name: impl Into<String>, task_type: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            description: None,
            task_type: task_type.into(),
            priority: DEFAULT_PRIORITY,
            status: TaskStatus::Pending,
            payload: serde_json::Value::Object(serde_json::Map::new()),
            source_id: None,
            dependencies: Vec::new(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            result: None,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_source(mut self, source_id: impl Into<String>) -> Self {
        self.source_id = Some(source_id.into());
        self
    }

    pub fn with_dependencies(mut self, dependencies: Vec<Uuid>) -> Self {
        self.dependencies = dependencies;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Check whether another attempt is allowed.
    pub fn can_retry(&self) -> bool {
        self.status == TaskStatus::Failed && self.retry_count < self.max_retries
    }

    pub(crate) fn mark_running(&mut self) {
        self.status = TaskStatus::Running;
        self.started_at = Some(Utc::now());
    }

    /// Record a successful result.
    ///
    /// Non-object results are wrapped as `{"result": value}`.
    pub(crate) fn complete(&mut self, result: serde_json::Value) {
        let result = match result {
            serde_json::Value::Object(_) => result,
            other => serde_json::json!({ "result": other }),
        };
        self.result = Some(result);
        self.error = None;
        self.status = TaskStatus::Completed;
        self.completed_at = Some(Utc::now());
    }

    pub(crate) fn fail(&mut self, error: impl Into<String>) {
        self.error = Some(error.into());
        self.result = None;
        self.status = TaskStatus::Failed;
        self.completed_at = Some(Utc::now());
    }

    /// Reset a failed task for another attempt.
    pub(crate) fn prepare_retry(&mut self) -> Result<(), SchedulerError> {
        if self.status != TaskStatus::Failed {
            return Err(SchedulerError::NotRetryable {
                task_id: self.id.to_string(),
                status: self.status.to_string(),
            });
        }
        if self.retry_count >= self.max_retries {
            return Err(SchedulerError::RetriesExhausted {
                task_id: self.id.to_string(),
                max_retries: self.max_retries,
            });
        }

        self.retry_count += 1;
        self.status = TaskStatus::Pending;
        self.result = None;
        self.error = None;
        self.started_at = None;
        self.completed_at = None;
        Ok(())
    }
}

/// Task description as delivered by the kernel in a `TaskRequested` event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRequest {
    pub name: String,
    #[serde(default = "default_task_type")]
    pub task_type: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub priority: Option<i32>,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub max_retries: Option<u32>,
}

fn default_task_type() -> String {
    "generic".to_string()
}

impl TaskRequest {
    /// Build a task, filling unset fields from the given defaults.
    pub fn into_task(
        self,
        default_timeout: Duration,
        default_max_retries: u32,
        source_id: Option<String>,
    ) -> Task {
        let mut task = Task::new(self.name, self.task_type)
            .with_timeout(
                self.timeout_ms
                    .map(Duration::from_millis)
                    .unwrap_or(default_timeout),
            )
            .with_priority(self.priority.unwrap_or(DEFAULT_PRIORITY));
        task.description = self.description;
        task.source_id = source_id;
        if !self.payload.is_null() {
            task.payload = self.payload;
        }
        task.max_retries = self.max_retries.unwrap_or(default_max_retries);
        task
    }
}
