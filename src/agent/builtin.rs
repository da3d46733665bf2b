//! Handlers every agent starts with.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;

use crate::agent::handler::{TaskContext, TaskHandler};
use crate::agent::task::Task;
use crate::error::TaskError;

/// Liveness check: answers with a pong and the current time.
pub struct PingHandler;

#[async_trait]
impl TaskHandler for PingHandler {
    async fn execute(
        &self,
        _task: &Task,
        _ctx: &TaskContext,
    ) -> Result<serde_json::Value, TaskError> {
        Ok(serde_json::json!({
            "pong": true,
            "timestamp": Utc::now().to_rfc3339(),
        }))
    }
}

/// Reports the agent's identity and counters as of dispatch.
pub struct StatusHandler;

#[async_trait]
impl TaskHandler for StatusHandler {
    async fn execute(
        &self,
        _task: &Task,
        ctx: &TaskContext,
    ) -> Result<serde_json::Value, TaskError> {
        let snapshot = &ctx.snapshot;
        Ok(serde_json::json!({
            "id": snapshot.id.to_string(),
            "name": snapshot.name,
            "status": snapshot.status,
            "health": snapshot.health,
            "task_count": snapshot.task_count,
            "success_count": snapshot.success_count,
            "failure_count": snapshot.failure_count,
        }))
    }
}

/// Generic execute: acknowledges the task. Replace it to do real work.
pub struct ExecuteHandler;

#[async_trait]
impl TaskHandler for ExecuteHandler {
    async fn execute(
        &self,
        task: &Task,
        _ctx: &TaskContext,
    ) -> Result<serde_json::Value, TaskError> {
        Ok(serde_json::json!({
            "executed": true,
            "task_id": task.id.to_string(),
        }))
    }
}

pub(crate) fn default_handlers() -> HashMap<String, Arc<dyn TaskHandler>> {
    let mut handlers: HashMap<String, Arc<dyn TaskHandler>> = HashMap::new();
    handlers.insert("ping".to_string(), Arc::new(PingHandler));
    handlers.insert("status".to_string(), Arc::new(StatusHandler));
    handlers.insert("execute".to_string(), Arc::new(ExecuteHandler));
    handlers
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::state::{AgentState, AgentType};
    use uuid::Uuid;

    fn context_with(state: AgentState) -> TaskContext {
        let id = Uuid::new_v4();
        TaskContext {
            agent_id: id,
            agent_name: "builtin".to_string(),
            snapshot: state.snapshot(id, "builtin", AgentType::Hybrid),
        }
    }

    #[tokio::test]
    async fn test_ping() {
        let value = PingHandler
            .execute(&Task::new("p", "ping"), &context_with(AgentState::default()))
            .await
            .unwrap();
        assert_eq!(value["pong"], true);
        assert!(value["timestamp"].is_string());
    }

    #[tokio::test]
    async fn test_status_reports_counters() {
        let state = AgentState {
            task_count: 3,
            success_count: 2,
            failure_count: 1,
            ..AgentState::default()
        };
        let value = StatusHandler
            .execute(&Task::new("s", "status"), &context_with(state))
            .await
            .unwrap();
        assert_eq!(value["name"], "builtin");
        assert_eq!(value["task_count"], 3);
        assert_eq!(value["failure_count"], 1);
        assert_eq!(value["health"], "healthy");
    }

    #[tokio::test]
    async fn test_execute_acknowledges() {
        let task = Task::new("e", "execute");
        let value = ExecuteHandler
            .execute(&task, &context_with(AgentState::default()))
            .await
            .unwrap();
        assert_eq!(value["executed"], true);
        assert_eq!(value["task_id"], task.id.to_string());
    }

    #[test]
    fn test_default_handler_set() {
        let handlers = default_handlers();
        let mut types: Vec<_> = handlers.keys().cloned().collect();
        types.sort();
        assert_eq!(types, vec!["execute", "ping", "status"]);
    }
}
