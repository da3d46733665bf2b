//! Client for the kernel's RPC surface.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::agent::{HEARTBEAT_EVENT, Heartbeat, HeartbeatSink};
use crate::config::KernelConfig;
use crate::error::RpcError;
use crate::kernel::protocol::{self, KernelStatus, RpcRequest, frame_event_type, subscribe_frame};
use crate::kernel::transport::{Connection, HttpWsTransport, Transport};

/// Request/response calls and event subscriptions against one kernel.
///
/// Calls are not retried here; callers decide what a failure means.
pub struct KernelClient {
    transport: Arc<dyn Transport>,
    connection: RwLock<Option<Arc<dyn Connection>>>,
    next_id: AtomicU64,
    connect_timeout: Duration,
    call_timeout: Duration,
}

impl KernelClient {
    pub fn new(transport: Arc<dyn Transport>, config: &KernelConfig) -> Self {
        Self {
            transport,
            connection: RwLock::new(None),
            next_id: AtomicU64::new(1),
            connect_timeout: config.connect_timeout(),
            call_timeout: config.call_timeout(),
        }
    }

    /// Client over HTTP and WebSocket at the configured URLs.
    pub fn from_config(config: &KernelConfig) -> Self {
        Self::new(Arc::new(HttpWsTransport::new(config)), config)
    }

    fn next_request_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Open the channel. A no-op when already connected.
    pub async fn connect(&self) -> Result<(), RpcError> {
        let mut slot = self.connection.write().await;
        if slot.is_some() {
            return Ok(());
        }

        let connection = tokio::time::timeout(self.connect_timeout, self.transport.connect())
            .await
            .map_err(|_| {
                RpcError::Connection(format!("timed out after {:?}", self.connect_timeout))
            })??;
        *slot = Some(Arc::from(connection));
        Ok(())
    }

    /// Close the channel. Safe to call any number of times.
    pub async fn disconnect(&self) {
        let connection = self.connection.write().await.take();
        if let Some(connection) = connection {
            connection.close().await;
            tracing::info!("Disconnected from kernel");
        }
    }

    pub async fn is_connected(&self) -> bool {
        self.connection.read().await.is_some()
    }

    async fn current(&self) -> Result<Arc<dyn Connection>, RpcError> {
        self.connection
            .read()
            .await
            .clone()
            .ok_or(RpcError::NotConnected)
    }

    /// Call `method` and return its result.
    pub async fn call(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, RpcError> {
        let connection = self.current().await?;
        let id = self.next_request_id();
        let request = RpcRequest::new(id, method, params);

        tracing::debug!(method, id, "Kernel call");
        let response = tokio::time::timeout(self.call_timeout, connection.request(&request))
            .await
            .map_err(|_| RpcError::Timeout {
                method: method.to_string(),
                timeout: self.call_timeout,
            })??;

        if response.id != id {
            return Err(RpcError::Protocol(format!(
                "response id {} does not match request id {}",
                response.id, id
            )));
        }
        response.into_result()
    }

    /// Subscribe to `event_type` and feed every matching frame to `handler`.
    ///
    /// Runs until the feed closes or fails. Spawn it to keep working in the
    /// meantime.
    pub async fn subscribe<F>(&self, event_type: &str, mut handler: F) -> Result<(), RpcError>
    where
        F: FnMut(serde_json::Value) + Send,
    {
        let connection = self.current().await?;
        connection.send_frame(subscribe_frame(event_type)).await?;
        tracing::info!(event_type, "Subscribed to kernel events");

        while let Some(frame) = connection.next_frame().await? {
            if frame_event_type(&frame) == Some(event_type) {
                handler(frame);
            }
        }

        tracing::info!(event_type, "Kernel event feed closed");
        Ok(())
    }

    // ==================== Kernel ====================

    pub async fn status(&self) -> Result<KernelStatus, RpcError> {
        let value = self.call(protocol::KERNEL_STATUS, None).await?;
        serde_json::from_value(value)
            .map_err(|e| RpcError::Protocol(format!("invalid kernel status: {}", e)))
    }

    pub async fn pause(&self) -> Result<serde_json::Value, RpcError> {
        self.call(protocol::KERNEL_PAUSE, None).await
    }

    pub async fn resume(&self) -> Result<serde_json::Value, RpcError> {
        self.call(protocol::KERNEL_RESUME, None).await
    }

    pub async fn shutdown(&self) -> Result<serde_json::Value, RpcError> {
        self.call(protocol::KERNEL_SHUTDOWN, None).await
    }

    /// Bytes of memory the kernel reports in use.
    pub async fn memory_usage(&self) -> Result<u64, RpcError> {
        let value = self.call(protocol::RESOURCE_MEMORY, None).await?;
        value
            .as_u64()
            .ok_or_else(|| unexpected(protocol::RESOURCE_MEMORY, &value))
    }

    // ==================== Events and tasks ====================

    /// Submit an event, returning its id.
    pub async fn submit_event(
        &self,
        event_type: &str,
        source_id: &str,
        payload: serde_json::Value,
    ) -> Result<String, RpcError> {
        let value = self
            .call(
                protocol::EVENT_SUBMIT,
                Some(serde_json::json!({
                    "event_type": event_type,
                    "source_id": source_id,
                    "payload": payload,
                })),
            )
            .await?;
        required_id(protocol::EVENT_SUBMIT, value)
    }

    /// Submit a task, returning its id.
    pub async fn submit_task(
        &self,
        name: &str,
        source_id: &str,
        payload: serde_json::Value,
    ) -> Result<String, RpcError> {
        let value = self
            .call(
                protocol::TASK_SUBMIT,
                Some(serde_json::json!({
                    "name": name,
                    "source_id": source_id,
                    "payload": payload,
                })),
            )
            .await?;
        required_id(protocol::TASK_SUBMIT, value)
    }

    /// Status of a task, `None` if the kernel does not know it.
    pub async fn task_status(&self, task_id: &str) -> Result<Option<String>, RpcError> {
        let value = self
            .call(
                protocol::TASK_STATUS,
                Some(serde_json::json!({ "task_id": task_id })),
            )
            .await?;
        match value {
            serde_json::Value::Null => Ok(None),
            serde_json::Value::String(status) => Ok(Some(status)),
            other => Err(unexpected(protocol::TASK_STATUS, &other)),
        }
    }

    pub async fn cancel_task(&self, task_id: &str) -> Result<bool, RpcError> {
        let value = self
            .call(
                protocol::TASK_CANCEL,
                Some(serde_json::json!({ "task_id": task_id })),
            )
            .await?;
        value
            .as_bool()
            .ok_or_else(|| unexpected(protocol::TASK_CANCEL, &value))
    }

    // ==================== Capabilities ====================

    pub async fn grant_capabilities(
        &self,
        entity_id: &str,
        entity_type: &str,
        capabilities: &[String],
    ) -> Result<serde_json::Value, RpcError> {
        self.call(
            protocol::CAPABILITY_GRANT,
            Some(serde_json::json!({
                "entity_id": entity_id,
                "entity_type": entity_type,
                "capabilities": capabilities,
            })),
        )
        .await
    }

    pub async fn check_capability(
        &self,
        entity_id: &str,
        capability: &str,
    ) -> Result<bool, RpcError> {
        let value = self
            .call(
                protocol::CAPABILITY_CHECK,
                Some(serde_json::json!({
                    "entity_id": entity_id,
                    "capability": capability,
                })),
            )
            .await?;
        value
            .as_bool()
            .ok_or_else(|| unexpected(protocol::CAPABILITY_CHECK, &value))
    }

    // ==================== Memory and checkpoints ====================

    pub async fn store_memory(
        &self,
        key: &str,
        value: serde_json::Value,
        memory_type: &str,
    ) -> Result<serde_json::Value, RpcError> {
        self.call(
            protocol::MEMORY_STORE,
            Some(serde_json::json!({
                "key": key,
                "value": value,
                "memory_type": memory_type,
            })),
        )
        .await
    }

    pub async fn get_memory(&self, key: &str) -> Result<Option<serde_json::Value>, RpcError> {
        let value = self
            .call(protocol::MEMORY_GET, Some(serde_json::json!({ "key": key })))
            .await?;
        Ok((!value.is_null()).then_some(value))
    }

    /// Store `state` for an entity, returning the checkpoint id.
    pub async fn create_checkpoint(
        &self,
        entity_type: &str,
        entity_id: &str,
        state: serde_json::Value,
    ) -> Result<String, RpcError> {
        let value = self
            .call(
                protocol::CHECKPOINT_CREATE,
                Some(serde_json::json!({
                    "entity_type": entity_type,
                    "entity_id": entity_id,
                    "state": state,
                })),
            )
            .await?;
        required_id(protocol::CHECKPOINT_CREATE, value)
    }

    /// Latest checkpointed state for an entity, if any.
    pub async fn restore_checkpoint(
        &self,
        entity_type: &str,
        entity_id: &str,
    ) -> Result<Option<serde_json::Value>, RpcError> {
        let value = self
            .call(
                protocol::CHECKPOINT_RESTORE,
                Some(serde_json::json!({
                    "entity_type": entity_type,
                    "entity_id": entity_id,
                })),
            )
            .await?;
        Ok((!value.is_null()).then_some(value))
    }
}

#[async_trait]
impl HeartbeatSink for KernelClient {
    async fn send_heartbeat(&self, heartbeat: &Heartbeat) -> Result<(), RpcError> {
        self.submit_event(
            HEARTBEAT_EVENT,
            &heartbeat.agent_id.to_string(),
            heartbeat.payload(),
        )
        .await
        .map(|_| ())
    }
}

impl std::fmt::Debug for KernelClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelClient")
            .field("next_id", &self.next_id.load(Ordering::SeqCst))
            .field("connect_timeout", &self.connect_timeout)
            .field("call_timeout", &self.call_timeout)
            .finish_non_exhaustive()
    }
}

fn unexpected(method: &str, value: &serde_json::Value) -> RpcError {
    RpcError::Protocol(format!("unexpected {} result: {}", method, value))
}

/// Ids come back as strings; numeric ids are accepted and stringified.
fn required_id(method: &str, value: serde_json::Value) -> Result<String, RpcError> {
    match value {
        serde_json::Value::String(id) => Ok(id),
        serde_json::Value::Number(id) => Ok(id.to_string()),
        other => Err(unexpected(method, &other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::AgentStatus;
    use crate::kernel::protocol::RpcResponse;
    use crate::kernel::in_process::InProcessTransport;
    use chrono::Utc;
    use serde_json::json;
    use std::sync::Mutex;
    use uuid::Uuid;

    fn config() -> KernelConfig {
        KernelConfig {
            connect_timeout_ms: 200,
            call_timeout_ms: 200,
            ..KernelConfig::default()
        }
    }

    fn kernel() -> InProcessTransport {
        let (transport, _push) = InProcessTransport::new(|request| {
            match request.method.as_str() {
                "checkpoint.create" => Ok(json!("cp-1")),
                "kernel.status" => Ok(json!({
                    "state": "running",
                    "version": "1.2.0",
                    "uptime_secs": 5,
                    "policy_mode": "permissive"
                })),
                "event.submit" => Ok(json!("evt-1")),
                "task.submit" => Ok(json!(42)),
                "task.status" => match request.params["task_id"].as_str() {
                    Some("known") => Ok(json!("running")),
                    _ => Ok(serde_json::Value::Null),
                },
                "task.cancel" => Ok(json!(true)),
                "capability.check" => Ok(json!(request.params["capability"] == "fs.read")),
                "memory.get" => Ok(serde_json::Value::Null),
                "resource.memory" => Ok(json!(1024)),
                "explode" => Err("boom".to_string()),
                _ => Ok(json!({"ok": true})),
            }
        });
        transport
    }

    async fn connected(transport: InProcessTransport) -> KernelClient {
        let client = KernelClient::new(Arc::new(transport), &config());
        client.connect().await.unwrap();
        client
    }

    #[tokio::test]
    async fn test_call_before_connect() {
        let client = KernelClient::new(Arc::new(kernel()), &config());
        assert!(matches!(
            client.call("kernel.status", None).await,
            Err(RpcError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_remote_error_carries_message() {
        let client = connected(kernel()).await;
        let err = client.call("explode", None).await.unwrap_err();
        assert!(matches!(&err, RpcError::Remote { message } if message == "boom"));
        assert!(err.to_string().contains("boom"));
    }

    #[tokio::test]
    async fn test_correlation_ids_increase() {
        let transport = kernel();
        let client = connected(transport.clone()).await;
        client.pause().await.unwrap();
        client.resume().await.unwrap();
        client.shutdown().await.unwrap();

        let requests = transport.requests().await;
        let ids: Vec<u64> = requests.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        let methods: Vec<&str> = requests.iter().map(|r| r.method.as_str()).collect();
        assert_eq!(methods, vec!["kernel.pause", "kernel.resume", "kernel.shutdown"]);
        assert_eq!(requests[0].params, json!({}));
    }

    #[tokio::test]
    async fn test_typed_wrappers() {
        let transport = kernel();
        let client = connected(transport.clone()).await;

        let status = client.status().await.unwrap();
        assert_eq!(status.state, "running");
        assert_eq!(status.policy_mode.as_deref(), Some("permissive"));

        assert_eq!(
            client.submit_event("Custom", "agent-1", json!({})).await.unwrap(),
            "evt-1"
        );
        assert_eq!(client.submit_task("build", "agent-1", json!({})).await.unwrap(), "42");
        assert_eq!(client.task_status("known").await.unwrap().as_deref(), Some("running"));
        assert_eq!(client.task_status("other").await.unwrap(), None);
        assert!(client.cancel_task("known").await.unwrap());
        assert!(client.check_capability("agent-1", "fs.read").await.unwrap());
        assert!(!client.check_capability("agent-1", "net").await.unwrap());
        assert_eq!(client.get_memory("k").await.unwrap(), None);
        assert_eq!(client.memory_usage().await.unwrap(), 1024);

        client
            .grant_capabilities("agent-1", "agent", &["fs.read".to_string()])
            .await
            .unwrap();
        assert_eq!(
            client
                .create_checkpoint("agent", "agent-1", json!({"status": "idle"}))
                .await
                .unwrap(),
            "cp-1"
        );
        assert!(matches!(
            client.restore_checkpoint("agent", "agent-1").await.unwrap(),
            Some(v) if v == json!({"ok": true})
        ));

        let requests = transport.requests().await;
        let grant = requests
            .iter()
            .find(|r| r.method == "capability.grant")
            .unwrap();
        assert_eq!(
            grant.params,
            json!({"entity_id": "agent-1", "entity_type": "agent", "capabilities": ["fs.read"]})
        );
    }

    #[tokio::test]
    async fn test_heartbeat_is_an_event() {
        let transport = kernel();
        let client = connected(transport.clone()).await;
        let agent_id = Uuid::new_v4();

        client
            .send_heartbeat(&Heartbeat {
                agent_id,
                timestamp: Utc::now(),
                status: AgentStatus::Idle,
                task_count: 2,
            })
            .await
            .unwrap();

        let request = transport.requests().await.pop().unwrap();
        assert_eq!(request.method, "event.submit");
        assert_eq!(request.params["event_type"], "AgentHeartbeat");
        assert_eq!(request.params["source_id"], agent_id.to_string());
        assert_eq!(request.params["payload"]["task_count"], 2);
        assert_eq!(request.params["payload"]["status"], "idle");
    }

    #[tokio::test]
    async fn test_subscribe_filters_by_event_type() {
        let (transport, push) = InProcessTransport::new(|_| Ok(json!(null)));
        let client = connected(transport.clone()).await;

        push.push(json!({"event_type": "TaskRequested", "n": 1})).await;
        push.push(json!({"event_type": "Other", "n": 2})).await;
        push.push(json!({"n": 3})).await;
        push.push(json!({"event_type": "TaskRequested", "n": 4})).await;
        push.close().await;

        let seen = Mutex::new(Vec::new());
        client
            .subscribe("TaskRequested", |frame| {
                seen.lock().unwrap().push(frame["n"].as_u64().unwrap());
            })
            .await
            .unwrap();

        assert_eq!(seen.into_inner().unwrap(), vec![1, 4]);
        assert_eq!(
            transport.sent_frames().await,
            vec![json!({"type": "subscribe", "event_type": "TaskRequested"})]
        );
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let client = connected(kernel()).await;
        assert!(client.is_connected().await);
        client.disconnect().await;
        client.disconnect().await;
        assert!(!client.is_connected().await);
        assert!(matches!(
            client.call("kernel.status", None).await,
            Err(RpcError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_connect_failure() {
        let client = KernelClient::new(
            Arc::new(InProcessTransport::refusing("connection refused")),
            &config(),
        );
        let err = client.connect().await.unwrap_err();
        assert!(matches!(err, RpcError::Connection(_)));
        assert!(!client.is_connected().await);
    }

    struct StalledTransport;

    #[async_trait]
    impl Transport for StalledTransport {
        async fn connect(&self) -> Result<Box<dyn Connection>, RpcError> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_connect_timeout() {
        let client = KernelClient::new(Arc::new(StalledTransport), &config());
        let err = client.connect().await.unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    /// Answers with a fixed id, or never when `id` is `None`.
    struct ScriptedConnection {
        id: Option<u64>,
    }

    #[async_trait]
    impl Connection for ScriptedConnection {
        async fn request(&self, _request: &RpcRequest) -> Result<RpcResponse, RpcError> {
            match self.id {
                Some(id) => Ok(RpcResponse::success(id, json!(null))),
                None => std::future::pending().await,
            }
        }

        async fn send_frame(&self, _frame: serde_json::Value) -> Result<(), RpcError> {
            Ok(())
        }

        async fn next_frame(&self) -> Result<Option<serde_json::Value>, RpcError> {
            Ok(None)
        }

        async fn close(&self) {}
    }

    struct ScriptedTransport {
        id: Option<u64>,
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn connect(&self) -> Result<Box<dyn Connection>, RpcError> {
            Ok(Box::new(ScriptedConnection { id: self.id }))
        }
    }

    #[tokio::test]
    async fn test_call_timeout() {
        let client = KernelClient::new(Arc::new(ScriptedTransport { id: None }), &config());
        client.connect().await.unwrap();
        let err = client.call("kernel.status", None).await.unwrap_err();
        assert!(matches!(err, RpcError::Timeout { ref method, .. } if method == "kernel.status"));
    }

    #[tokio::test]
    async fn test_mismatched_response_id() {
        let client = KernelClient::new(Arc::new(ScriptedTransport { id: Some(99) }), &config());
        client.connect().await.unwrap();
        let err = client.call("kernel.status", None).await.unwrap_err();
        assert!(matches!(err, RpcError::Protocol(_)));
    }
}
