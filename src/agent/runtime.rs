//! The agent runtime: task intake, bounded dispatch, timeouts, heartbeats.
//!
//! Two loops run on the tokio runtime once [`AgentRuntime::start`] is
//! called:
//!
//! - the **dispatch loop** takes a slot from a semaphore sized
//!   `max_concurrent_tasks`, waits (bounded by `poll_interval`) for the next
//!   queued task and spawns a worker that owns the slot until the task is
//!   finalized. With one slot the queue is drained strictly in FIFO order.
//! - the **heartbeat loop** stamps `last_heartbeat` every
//!   `heartbeat_interval` and forwards a [`Heartbeat`] to the configured sink.
//!
//! All agent status/counter mutation goes through one `RwLock`, and each task
//! is finalized exactly once, under that lock, whatever way it ended.
//!
//! Pending and running tasks are always retrievable by id. Finished records
//! are kept for the `task_history` most recently finished tasks.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use lru::LruCache;
use tokio::sync::{Mutex, RwLock, Semaphore, broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::agent::builtin::default_handlers;
use crate::agent::handler::{HandlerRegistry, TaskContext, TaskHandler};
use crate::agent::heartbeat::{Heartbeat, HeartbeatSink};
use crate::agent::retry::RetryPolicy;
use crate::agent::state::{AgentHealth, AgentSnapshot, AgentState, AgentStatus, AgentType};
use crate::agent::task::{Task, TaskRequest, TaskStatus};
use crate::config::AgentConfig;
use crate::error::{SchedulerError, TaskError};

const FINISHED_FEED_CAPACITY: usize = 256;

/// Handle to a running (or not yet started) agent. Cheap to clone.
#[derive(Clone)]
pub struct AgentRuntime {
    shared: Arc<Shared>,
}

struct Shared {
    id: Uuid,
    name: String,
    agent_type: AgentType,
    config: AgentConfig,
    retry: RetryPolicy,
    state: RwLock<AgentState>,
    handlers: HandlerRegistry,
    queue_tx: mpsc::UnboundedSender<Task>,
    /// Taken by the dispatch loop on start.
    queue_rx: Mutex<Option<mpsc::UnboundedReceiver<Task>>>,
    tasks: RwLock<TaskRecords>,
    finished: broadcast::Sender<Task>,
    slots: Arc<Semaphore>,
    closed: AtomicBool,
    shutdown: watch::Sender<bool>,
    loops: Mutex<Vec<JoinHandle<()>>>,
    heartbeat_sink: Option<Arc<dyn HeartbeatSink>>,
}

impl AgentRuntime {
    /// Create an agent with the default `ping`, `status` and `execute`
    /// handlers registered.
    pub fn new(config: AgentConfig) -> Self {
        Self::build(config, None)
    }

    /// Create an agent that reports heartbeats to `sink`.
    pub fn with_heartbeat_sink(config: AgentConfig, sink: Arc<dyn HeartbeatSink>) -> Self {
        Self::build(config, Some(sink))
    }

    fn build(config: AgentConfig, heartbeat_sink: Option<Arc<dyn HeartbeatSink>>) -> Self {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let (finished, _) = broadcast::channel(FINISHED_FEED_CAPACITY);
        let (shutdown, _) = watch::channel(false);
        let slots = Arc::new(Semaphore::new(config.max_concurrent_tasks.max(1)));
        let tasks = TaskRecords::new(config.task_history);

        Self {
            shared: Arc::new(Shared {
                id: Uuid::new_v4(),
                name: config.name.clone(),
                agent_type: config.agent_type,
                retry: config.retry_policy(),
                config,
                state: RwLock::new(AgentState::default()),
                handlers: HandlerRegistry::with_handlers(default_handlers()),
                queue_tx,
                queue_rx: Mutex::new(Some(queue_rx)),
                tasks: RwLock::new(tasks),
                finished,
                slots,
                closed: AtomicBool::new(false),
                shutdown,
                loops: Mutex::new(Vec::new()),
                heartbeat_sink,
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Build a task from a kernel request. Timeout and retry limit fall back
    /// to the agent's configuration when the request leaves them unset.
    pub fn task_from_request(&self, request: TaskRequest, source_id: Option<String>) -> Task {
        request.into_task(
            self.shared.config.task_timeout(),
            self.shared.retry.max_retries,
            source_id,
        )
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.shared.retry
    }

    /// Register a handler for a task type, replacing any previous one.
    ///
    /// Safe to call before or after [`start`](Self::start); tasks dequeued
    /// afterwards use the new handler.
    pub async fn register_handler(&self, task_type: impl Into<String>, handler: Arc<dyn TaskHandler>) {
        self.shared.handlers.register(task_type, handler).await;
    }

    pub fn handlers(&self) -> &HandlerRegistry {
        &self.shared.handlers
    }

    /// Queue a task for execution.
    ///
    /// Never waits for the task to run. Fails with
    /// [`SchedulerError::QueueClosed`] once the agent has been stopped.
    pub async fn submit(&self, mut task: Task) -> Result<Uuid, SchedulerError> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(SchedulerError::QueueClosed);
        }

        task.status = TaskStatus::Pending;
        let task_id = task.id;
        self.shared.tasks.write().await.record(task.clone());

        self.shared
            .queue_tx
            .send(task)
            .map_err(|_| SchedulerError::QueueClosed)?;

        tracing::debug!(task_id = %task_id, agent = %self.shared.name, "Task submitted");
        Ok(task_id)
    }

    /// Start the dispatch and heartbeat loops.
    pub async fn start(&self) -> Result<(), SchedulerError> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(SchedulerError::QueueClosed);
        }
        let queue_rx = self
            .shared
            .queue_rx
            .lock()
            .await
            .take()
            .ok_or(SchedulerError::AlreadyRunning)?;

        tracing::info!(
            agent = %self.shared.name,
            agent_id = %self.shared.id,
            max_concurrent_tasks = self.shared.config.max_concurrent_tasks,
            "Starting agent"
        );

        let heartbeat = tokio::spawn(heartbeat_loop(
            Arc::clone(&self.shared),
            self.shared.shutdown.subscribe(),
        ));
        let dispatch = tokio::spawn(dispatch_loop(
            Arc::clone(&self.shared),
            queue_rx,
            self.shared.shutdown.subscribe(),
        ));

        self.shared.loops.lock().await.extend([heartbeat, dispatch]);
        Ok(())
    }

    /// Stop accepting tasks and let both loops exit after their current unit
    /// of work.
    ///
    /// In-flight tasks are not cancelled; this waits until they have been
    /// finalized. Tasks still queued stay `pending`.
    pub async fn stop(&self) {
        tracing::info!(agent = %self.shared.name, "Stopping agent");
        self.shared.closed.store(true, Ordering::SeqCst);
        let _ = self.shared.shutdown.send(true);

        let loops = std::mem::take(&mut *self.shared.loops.lock().await);
        for handle in loops {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Agent loop ended abnormally");
            }
        }

        // Every slot free means no worker is still finalizing.
        let slots = self.shared.config.max_concurrent_tasks.max(1) as u32;
        if let Ok(permits) = self.shared.slots.acquire_many(slots).await {
            drop(permits);
        }
    }

    /// Check whether [`stop`](Self::stop) has been called.
    pub fn is_stopped(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Snapshot of agent status, counters and auxiliary state.
    pub async fn state(&self) -> AgentSnapshot {
        self.shared.snapshot().await
    }

    /// Merge free-form keys into the auxiliary state map.
    pub async fn set_state(&self, values: serde_json::Map<String, serde_json::Value>) {
        self.shared.state.write().await.extra.extend(values);
    }

    /// Move the agent into an extension status such as `Planning` or
    /// `Waiting`. Ignored while the agent is in the sticky `Error` status.
    pub async fn set_status(&self, status: AgentStatus) {
        let mut state = self.shared.state.write().await;
        if state.status == AgentStatus::Error {
            tracing::warn!(requested = %status, "Ignoring status change while in error state");
            return;
        }
        state.status = status;
    }

    pub async fn set_health(&self, health: AgentHealth) {
        self.shared.state.write().await.health = health;
    }

    /// Put the agent into the sticky `Error` status.
    pub async fn enter_error(&self, reason: impl Into<String>) {
        self.shared.enter_error(reason.into()).await;
    }

    /// Clear a sticky `Error` status. Returns true if the agent was in error.
    pub async fn reset(&self) -> bool {
        let mut state = self.shared.state.write().await;
        if state.status != AgentStatus::Error {
            return false;
        }
        state.status = if state.in_flight.is_empty() {
            AgentStatus::Idle
        } else {
            AgentStatus::Executing
        };
        tracing::info!(agent = %self.shared.name, "Agent error state cleared");
        true
    }

    /// Latest record of a submitted task. `None` for unknown ids and for
    /// finished tasks that have aged out of the history.
    pub async fn task(&self, task_id: Uuid) -> Option<Task> {
        self.shared.tasks.read().await.get(&task_id).cloned()
    }

    /// Feed of tasks as they are finalized.
    pub fn finished_tasks(&self) -> broadcast::Receiver<Task> {
        self.shared.finished.subscribe()
    }

    /// Wait until the task reaches a terminal status.
    ///
    /// Returns `None` for unknown task ids. Callers wanting a deadline wrap
    /// this in `tokio::time::timeout`.
    pub async fn wait_for(&self, task_id: Uuid) -> Option<Task> {
        let mut feed = self.shared.finished.subscribe();

        match self.task(task_id).await {
            Some(task) if task.is_terminal() => return Some(task),
            Some(_) => {}
            None => return None,
        }

        loop {
            match feed.recv().await {
                Ok(task) if task.id == task_id && task.is_terminal() => return Some(task),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {
                    if let Some(task) = self.task(task_id).await
                        && task.is_terminal()
                    {
                        return Some(task);
                    }
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Resubmit a failed task after the backoff delay for its attempt.
    ///
    /// Returns the delay applied. The task's own `max_retries` bounds the
    /// number of attempts.
    pub async fn schedule_retry(&self, mut task: Task) -> Result<Duration, SchedulerError> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(SchedulerError::QueueClosed);
        }

        let attempt = task.retry_count;
        task.prepare_retry()?;
        let delay = self.shared.retry.next_delay(attempt);
        self.shared.tasks.write().await.record(task.clone());

        tracing::info!(
            task_id = %task.id,
            retry = task.retry_count,
            max_retries = task.max_retries,
            delay_ms = delay.as_millis() as u64,
            "Scheduling task retry"
        );

        let runtime = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let task_id = task.id;
            if let Err(e) = runtime.submit(task).await {
                tracing::warn!(task_id = %task_id, error = %e, "Dropping retry");
            }
        });

        Ok(delay)
    }
}

/// Task records by id: every live task, plus a bounded history of finished
/// ones.
struct TaskRecords {
    live: HashMap<Uuid, Task>,
    finished: LruCache<Uuid, Task>,
}

impl TaskRecords {
    fn new(history: usize) -> Self {
        Self {
            live: HashMap::new(),
            finished: LruCache::new(NonZeroUsize::new(history).unwrap_or(NonZeroUsize::MIN)),
        }
    }

    /// Store the latest record, moving it between live and finished.
    fn record(&mut self, task: Task) {
        if task.is_terminal() {
            self.live.remove(&task.id);
            self.finished.put(task.id, task);
        } else {
            self.finished.pop(&task.id);
            self.live.insert(task.id, task);
        }
    }

    fn get(&self, task_id: &Uuid) -> Option<&Task> {
        self.live
            .get(task_id)
            .or_else(|| self.finished.peek(task_id))
    }
}

impl Shared {
    async fn snapshot(&self) -> AgentSnapshot {
        self.state
            .read()
            .await
            .snapshot(self.id, &self.name, self.agent_type)
    }

    async fn enter_error(&self, reason: String) {
        let mut state = self.state.write().await;
        tracing::error!(agent = %self.name, reason = %reason, "Agent entering error state");
        state.status = AgentStatus::Error;
        state.last_error = Some(reason);
    }

    /// Mark the task as in flight and build its handler context.
    async fn begin(&self, task: &Task) -> TaskContext {
        let snapshot = {
            let mut state = self.state.write().await;
            state.in_flight.push(task.id);
            if state.status != AgentStatus::Error {
                state.status = AgentStatus::Executing;
            }
            state.snapshot(self.id, &self.name, self.agent_type)
        };
        self.tasks.write().await.record(task.clone());

        TaskContext {
            agent_id: self.id,
            agent_name: self.name.clone(),
            snapshot,
        }
    }

    /// Run the handler for `task` bounded by its timeout.
    async fn run_handler(&self, task: &Task, ctx: &TaskContext) -> Result<serde_json::Value, String> {
        let Some(handler) = self.handlers.get(&task.task_type).await else {
            return Err(SchedulerError::NoHandler {
                task_type: task.task_type.clone(),
            }
            .to_string());
        };

        let timeout = task.timeout();
        let job_task = task.clone();
        let job_ctx = ctx.clone();
        let mut job = tokio::spawn(async move { handler.execute(&job_task, &job_ctx).await });

        match tokio::time::timeout(timeout, &mut job).await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(e))) => Err(e.to_string()),
            Ok(Err(join_error)) => Err(TaskError::Panicked(join_error.to_string()).to_string()),
            Err(_) => {
                job.abort();
                Err(SchedulerError::TaskTimeout { timeout }.to_string())
            }
        }
    }

    /// Record the terminal task and update counters. Called once per task.
    async fn finalize(&self, task: Task) {
        {
            let mut state = self.state.write().await;
            state.task_count += 1;
            match task.status {
                TaskStatus::Completed => state.success_count += 1,
                _ => {
                    state.failure_count += 1;
                    state.last_error = task.error.clone();
                }
            }
            state.in_flight.retain(|id| *id != task.id);
            if state.in_flight.is_empty() && state.status == AgentStatus::Executing {
                state.status = AgentStatus::Idle;
            }
        }

        self.tasks.write().await.record(task.clone());
        // No subscribers is fine.
        let _ = self.finished.send(task);
    }

    async fn beat(&self) -> Heartbeat {
        let mut state = self.state.write().await;
        let now = Utc::now();
        state.last_heartbeat = Some(now);
        Heartbeat {
            agent_id: self.id,
            timestamp: now,
            status: state.status,
            task_count: state.task_count,
        }
    }
}

async fn process_task(shared: &Shared, mut task: Task) {
    tracing::info!(task_id = %task.id, task_type = %task.task_type, name = %task.name, "Processing task");

    task.mark_running();
    let ctx = shared.begin(&task).await;

    match shared.run_handler(&task, &ctx).await {
        Ok(value) => {
            task.complete(value);
            tracing::info!(task_id = %task.id, "Task completed");
        }
        Err(error) => {
            tracing::error!(task_id = %task.id, error = %error, "Task failed");
            task.fail(error);
        }
    }

    shared.finalize(task).await;
}

async fn dispatch_loop(
    shared: Arc<Shared>,
    mut queue: mpsc::UnboundedReceiver<Task>,
    mut shutdown: watch::Receiver<bool>,
) {
    let poll_interval = shared.config.poll_interval();

    loop {
        if *shutdown.borrow() {
            break;
        }

        let permit = match Arc::clone(&shared.slots).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                shared
                    .enter_error("task slot semaphore closed".to_string())
                    .await;
                break;
            }
        };

        let task = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            received = tokio::time::timeout(poll_interval, queue.recv()) => match received {
                Ok(Some(task)) => task,
                Ok(None) => {
                    shared.enter_error("task queue disconnected".to_string()).await;
                    break;
                }
                Err(_) => continue,
            },
        };

        let worker_shared = Arc::clone(&shared);
        tokio::spawn(async move {
            let _permit = permit;
            process_task(&worker_shared, task).await;
        });
    }

    tracing::debug!(agent = %shared.name, "Dispatch loop stopped");
}

async fn heartbeat_loop(shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
    let interval = shared.config.heartbeat_interval();

    loop {
        if *shutdown.borrow() {
            break;
        }

        let heartbeat = shared.beat().await;
        if let Some(ref sink) = shared.heartbeat_sink
            && let Err(e) = sink.send_heartbeat(&heartbeat).await
        {
            tracing::warn!(agent = %shared.name, error = %e, "Heartbeat failed");
        }

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.changed() => break,
        }
    }

    tracing::debug!(agent = %shared.name, "Heartbeat loop stopped");
}
