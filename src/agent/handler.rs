//! Task handler trait and registry.

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::agent::state::AgentSnapshot;
use crate::agent::task::Task;
use crate::error::TaskError;

/// Context handed to a handler alongside the task.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub agent_id: Uuid,
    pub agent_name: String,
    /// Agent state as of dispatch.
    pub snapshot: AgentSnapshot,
}

/// Executes tasks of one `task_type`.
///
/// A handler runs on its own tokio task. If it outlives the task's timeout
/// it is aborted at its next await point; handlers that block a thread are
/// abandoned instead.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Run the task. `Ok` values that are not JSON objects are wrapped as
    /// `{"result": value}`; the `Err` display text becomes the task error.
    async fn execute(&self, task: &Task, ctx: &TaskContext)
    -> Result<serde_json::Value, TaskError>;
}

/// Adapter turning an async closure into a [`TaskHandler`].
pub struct FnHandler<F, Fut> {
    func: F,
    _marker: PhantomData<fn() -> Fut>,
}

#[async_trait]
impl<F, Fut> TaskHandler for FnHandler<F, Fut>
where
    F: Fn(Task, TaskContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<serde_json::Value, TaskError>> + Send + 'static,
{
    async fn execute(
        &self,
        task: &Task,
        ctx: &TaskContext,
    ) -> Result<serde_json::Value, TaskError> {
        (self.func)(task.clone(), ctx.clone()).await
    }
}

/// Wrap an async closure as a shareable handler.
pub fn handler_fn<F, Fut>(func: F) -> Arc<dyn TaskHandler>
where
    F: Fn(Task, TaskContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<serde_json::Value, TaskError>> + Send + 'static,
{
    Arc::new(FnHandler {
        func,
        _marker: PhantomData,
    })
}

/// Map from task type to handler.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn TaskHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_handlers(handlers: HashMap<String, Arc<dyn TaskHandler>>) -> Self {
        Self {
            handlers: RwLock::new(handlers),
        }
    }

    /// Register a handler, replacing any previous one for the type.
    /// Returns true if a handler was replaced.
    pub async fn register(&self, task_type: impl Into<String>, handler: Arc<dyn TaskHandler>) -> bool {
        let task_type = task_type.into();
        let replaced = self
            .handlers
            .write()
            .await
            .insert(task_type.clone(), handler)
            .is_some();
        tracing::info!(task_type = %task_type, replaced, "Registered task handler");
        replaced
    }

    pub async fn get(&self, task_type: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.read().await.get(task_type).cloned()
    }

    /// Registered task types, sorted.
    pub async fn task_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.read().await.keys().cloned().collect();
        types.sort();
        types
    }
}
