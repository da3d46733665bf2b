//! Task handlers over a shared [`MemoryStore`].
//!
//! - `memory.store`: `{key, value, memory_type?, importance?}` into the
//!   long-term tier
//! - `memory.search`: `{query, limit?}`, limit defaults to 5 and is capped at 20
//! - `memory.retrieve`: `{key}`, answering `{key, found, value}`

use std::sync::Arc;

use async_trait::async_trait;

use crate::agent::handler::{TaskContext, TaskHandler};
use crate::agent::runtime::AgentRuntime;
use crate::agent::task::Task;
use crate::error::TaskError;
use crate::memory::MemoryStore;

pub const MEMORY_STORE_TASK: &str = "memory.store";
pub const MEMORY_SEARCH_TASK: &str = "memory.search";
pub const MEMORY_RETRIEVE_TASK: &str = "memory.retrieve";

const DEFAULT_SEARCH_LIMIT: u64 = 5;
const MAX_SEARCH_LIMIT: u64 = 20;

fn required_str<'a>(task: &'a Task, field: &str) -> Result<&'a str, TaskError> {
    task.payload
        .get(field)
        .and_then(|v| v.as_str())
        .ok_or_else(|| TaskError::InvalidPayload(format!("missing '{field}' string")))
}

/// Writes a fact to long-term memory.
pub struct MemoryStoreHandler {
    store: Arc<MemoryStore>,
}

impl MemoryStoreHandler {
    pub fn new(store: Arc<MemoryStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl TaskHandler for MemoryStoreHandler {
    async fn execute(
        &self,
        task: &Task,
        _ctx: &TaskContext,
    ) -> Result<serde_json::Value, TaskError> {
        let key = required_str(task, "key")?;
        let value = task
            .payload
            .get("value")
            .cloned()
            .ok_or_else(|| TaskError::InvalidPayload("missing 'value'".to_string()))?;
        let memory_type = task
            .payload
            .get("memory_type")
            .and_then(|v| v.as_str())
            .unwrap_or("fact");
        let importance = task
            .payload
            .get("importance")
            .and_then(|v| v.as_f64())
            .unwrap_or(0.5) as f32;

        self.store.store(key, value, memory_type, importance).await?;

        Ok(serde_json::json!({
            "stored": true,
            "key": key,
        }))
    }
}

/// Searches long-term memory.
pub struct MemorySearchHandler {
    store: Arc<MemoryStore>,
}

impl MemorySearchHandler {
    pub fn new(store: Arc<MemoryStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl TaskHandler for MemorySearchHandler {
    async fn execute(
        &self,
        task: &Task,
        _ctx: &TaskContext,
    ) -> Result<serde_json::Value, TaskError> {
        let query = required_str(task, "query")?;
        let limit = task
            .payload
            .get("limit")
            .and_then(|v| v.as_u64())
            .unwrap_or(DEFAULT_SEARCH_LIMIT)
            .clamp(1, MAX_SEARCH_LIMIT) as usize;

        let results = self.store.search(query, limit).await;

        Ok(serde_json::json!({
            "query": query,
            "result_count": results.len(),
            "results": results,
        }))
    }
}

/// Reads one long-term entry by key.
pub struct MemoryRetrieveHandler {
    store: Arc<MemoryStore>,
}

impl MemoryRetrieveHandler {
    pub fn new(store: Arc<MemoryStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl TaskHandler for MemoryRetrieveHandler {
    async fn execute(
        &self,
        task: &Task,
        _ctx: &TaskContext,
    ) -> Result<serde_json::Value, TaskError> {
        let key = required_str(task, "key")?;
        let value = self.store.retrieve(key).await;

        Ok(serde_json::json!({
            "key": key,
            "found": value.is_some(),
            "value": value,
        }))
    }
}

/// Register the three memory handlers on `runtime`.
pub async fn register_memory_handlers(runtime: &AgentRuntime, store: Arc<MemoryStore>) {
    runtime
        .register_handler(
            MEMORY_STORE_TASK,
            Arc::new(MemoryStoreHandler::new(Arc::clone(&store))),
        )
        .await;
    runtime
        .register_handler(
            MEMORY_SEARCH_TASK,
            Arc::new(MemorySearchHandler::new(Arc::clone(&store))),
        )
        .await;
    runtime
        .register_handler(MEMORY_RETRIEVE_TASK, Arc::new(MemoryRetrieveHandler::new(store)))
        .await;
}
