//! Tool execution gateway.
//!
//! Tools are external programs registered under a logical name. The gateway
//! runs them with arguments, optional stdin, working directory and
//! environment overrides, bounded by a deadline and a concurrency limit.

mod gateway;
mod handler;
mod result;
mod runner;

pub use gateway::{ToolGateway, ToolInvocation, ToolSpec, ToolType, default_tools};
pub use handler::{TOOL_TASK, ToolTaskHandler};
pub use result::{NO_EXIT_CODE, ToolResult};
pub use runner::{CommandOutput, CommandRunner, CommandSpec, ProcessRunner, find_on_path};
