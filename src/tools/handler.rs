//! Task handler that runs tools through the gateway.

use std::sync::Arc;

use async_trait::async_trait;

use crate::agent::{Task, TaskContext, TaskHandler};
use crate::error::TaskError;
use crate::tools::gateway::{ToolGateway, ToolInvocation};

/// Task type routed to [`ToolTaskHandler`].
pub const TOOL_TASK: &str = "tool";

/// Runs the [`ToolInvocation`] in the task payload.
///
/// The task completes with the [`ToolResult`](crate::tools::ToolResult) even
/// when the tool itself failed or timed out; callers inspect `success`. Only
/// a malformed payload or an unknown tool fails the task.
pub struct ToolTaskHandler {
    gateway: Arc<ToolGateway>,
}

impl ToolTaskHandler {
    pub fn new(gateway: Arc<ToolGateway>) -> Self {
        Self { gateway }
    }
}

#[async_trait]
impl TaskHandler for ToolTaskHandler {
    async fn execute(
        &self,
        task: &Task,
        _ctx: &TaskContext,
    ) -> Result<serde_json::Value, TaskError> {
        let invocation: ToolInvocation = serde_json::from_value(task.payload.clone())
            .map_err(|e| TaskError::InvalidPayload(e.to_string()))?;
        let tool = invocation.tool.clone();

        let result = self.gateway.execute(invocation).await?;
        tracing::info!(
            task_id = %task.id,
            tool = %tool,
            success = result.success,
            exit_code = result.exit_code,
            duration_ms = result.duration_ms,
            "Tool finished"
        );

        serde_json::to_value(&result).map_err(|e| TaskError::failed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::AgentType;
    use crate::agent::state::AgentState;
    use crate::config::ToolsConfig;
    use crate::error::GatewayError;
    use crate::tools::gateway::{ToolSpec, ToolType};
    use crate::tools::runner::{CommandOutput, CommandRunner, CommandSpec};
    use serde_json::json;
    use uuid::Uuid;

    struct ExitWith(i32);

    #[async_trait]
    impl CommandRunner for ExitWith {
        async fn run(&self, _spec: &CommandSpec) -> std::io::Result<CommandOutput> {
            Ok(CommandOutput {
                exit_code: self.0,
                stdout: "out".to_string(),
                stderr: String::new(),
            })
        }
    }

    fn ctx() -> TaskContext {
        let id = Uuid::new_v4();
        TaskContext {
            agent_id: id,
            agent_name: "tools".to_string(),
            snapshot: AgentState::default().snapshot(id, "tools", AgentType::Reactive),
        }
    }

    async fn handler(exit_code: i32) -> ToolTaskHandler {
        let gateway = ToolGateway::new(&ToolsConfig::default(), Arc::new(ExitWith(exit_code)));
        gateway
            .register_tool(ToolSpec::new("lint", "lint", ToolType::Linter, ""))
            .await;
        ToolTaskHandler::new(Arc::new(gateway))
    }

    fn tool_task(payload: serde_json::Value) -> Task {
        Task::new("run tool", TOOL_TASK).with_payload(payload)
    }

    #[tokio::test]
    async fn test_tool_failure_still_completes() {
        let value = handler(1)
            .await
            .execute(&tool_task(json!({"tool": "lint", "args": ["src"]})), &ctx())
            .await
            .unwrap();
        assert_eq!(value["success"], false);
        assert_eq!(value["exit_code"], 1);
        assert_eq!(value["stdout"], "out");
    }

    #[tokio::test]
    async fn test_unknown_tool_fails_task() {
        let err = handler(0)
            .await
            .execute(&tool_task(json!({"tool": "ghost"})), &ctx())
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::Gateway(GatewayError::UnknownTool { .. })));
        assert_eq!(err.to_string(), "Unknown tool: ghost");
    }

    #[tokio::test]
    async fn test_bad_payload() {
        let err = handler(0)
            .await
            .execute(&tool_task(json!({"args": ["x"]})), &ctx())
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::InvalidPayload(_)));
    }
}
