//! Pulse agent runtime.
//!
//! An agent process that takes tasks from the kernel, runs them under
//! timeouts and a concurrency bound, keeps a dual-tier memory, runs external
//! tools, and reports heartbeats back over RPC.

pub mod agent;
pub mod config;
pub mod error;
pub mod kernel;
pub mod memory;
pub mod tools;

pub use config::Config;
pub use error::{Error, Result};
