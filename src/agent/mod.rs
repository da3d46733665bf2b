//! Core agent logic.
//!
//! The agent orchestrates:
//! - Task intake through an unbounded FIFO queue
//! - Bounded concurrent dispatch to handlers registered by task type
//! - Per-task timeout enforcement and exactly-once finalization
//! - Periodic heartbeats to the kernel
//! - Backoff policy for components that resubmit failed tasks

mod builtin;
mod handler;
mod heartbeat;
mod memory_handlers;
mod retry;
mod runtime;
pub(crate) mod state;
mod task;

pub use builtin::{ExecuteHandler, PingHandler, StatusHandler};
pub use handler::{FnHandler, HandlerRegistry, TaskContext, TaskHandler, handler_fn};
pub use heartbeat::{HEARTBEAT_EVENT, Heartbeat, HeartbeatSink};
pub use memory_handlers::{
    MEMORY_RETRIEVE_TASK, MEMORY_SEARCH_TASK, MEMORY_STORE_TASK, MemoryRetrieveHandler,
    MemorySearchHandler, MemoryStoreHandler, register_memory_handlers,
};
pub use retry::RetryPolicy;
pub use runtime::AgentRuntime;
pub use state::{AgentHealth, AgentSnapshot, AgentStatus, AgentType};
pub use task::{Task, TaskRequest, TaskStatus};
