//! Outcome of one tool run.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::tools::runner::CommandOutput;

/// Exit code reported when the process never produced one.
pub const NO_EXIT_CODE: i32 = -1;

/// Result of a tool execution. Timeouts and launch failures are results
/// too, with `success == false` and `exit_code == -1`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub success: bool,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    /// Wall-clock time, whatever the outcome.
    pub duration_ms: u64,
    #[serde(default)]
    pub output_files: Vec<String>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl ToolResult {
    pub(crate) fn completed(output: CommandOutput, elapsed: Duration) -> Self {
        Self {
            success: output.exit_code == 0,
            exit_code: output.exit_code,
            stdout: output.stdout,
            stderr: output.stderr,
            duration_ms: millis(elapsed),
            output_files: Vec::new(),
            metadata: HashMap::new(),
        }
    }

    pub(crate) fn timed_out(timeout: Duration, elapsed: Duration) -> Self {
        Self {
            success: false,
            exit_code: NO_EXIT_CODE,
            stdout: String::new(),
            stderr: format!("Tool execution timed out after {}ms", timeout.as_millis()),
            duration_ms: millis(elapsed),
            output_files: Vec::new(),
            metadata: HashMap::from([("timeout".to_string(), serde_json::Value::Bool(true))]),
        }
    }

    pub(crate) fn launch_failed(error: &std::io::Error, elapsed: Duration) -> Self {
        Self {
            success: false,
            exit_code: NO_EXIT_CODE,
            stdout: String::new(),
            stderr: error.to_string(),
            duration_ms: millis(elapsed),
            output_files: Vec::new(),
            metadata: HashMap::from([(
                "error".to_string(),
                serde_json::Value::String(error.to_string()),
            )]),
        }
    }

    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }

    pub fn is_timeout(&self) -> bool {
        self.metadata
            .get("timeout")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }
}

fn millis(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
}
