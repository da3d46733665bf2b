//! Feeds kernel task requests into the agent runtime.

use tokio::sync::mpsc;

use crate::agent::{AgentRuntime, TaskRequest};
use crate::error::RpcError;
use crate::kernel::client::KernelClient;
use crate::kernel::protocol::{KernelEvent, TASK_REQUESTED_EVENT};

/// Subscribe to `TaskRequested` events and submit each one to `runtime`.
///
/// Returns the number of tasks submitted once the kernel closes the feed.
/// Malformed events are logged and skipped.
pub async fn forward_task_requests(
    client: &KernelClient,
    runtime: &AgentRuntime,
) -> Result<usize, RpcError> {
    let (tx, mut rx) = mpsc::unbounded_channel::<serde_json::Value>();

    let subscription = client.subscribe(TASK_REQUESTED_EVENT, move |frame| {
        // The receiver outlives the subscription.
        let _ = tx.send(frame);
    });

    let submit = async {
        let mut submitted = 0;
        while let Some(frame) = rx.recv().await {
            let (request, source_id) = match parse_request(frame) {
                Ok(parsed) => parsed,
                Err(e) => {
                    tracing::warn!(error = %e, "Ignoring malformed task request");
                    continue;
                }
            };

            let task = runtime.task_from_request(request, source_id);
            match runtime.submit(task).await {
                Ok(task_id) => {
                    submitted += 1;
                    tracing::debug!(task_id = %task_id, "Queued task from kernel");
                }
                Err(e) => tracing::warn!(error = %e, "Dropping task request"),
            }
        }
        submitted
    };

    let (subscribed, submitted) = tokio::join!(subscription, submit);
    subscribed.map(|()| submitted)
}

fn parse_request(
    frame: serde_json::Value,
) -> Result<(TaskRequest, Option<String>), serde_json::Error> {
    let event: KernelEvent = serde_json::from_value(frame)?;
    let request: TaskRequest = serde_json::from_value(event.payload)?;
    Ok((request, event.source_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use crate::agent::{HeartbeatSink, TaskStatus, register_memory_handlers};
    use crate::config::{AgentConfig, KernelConfig, MemoryConfig};
    use crate::kernel::in_process::InProcessTransport;
    use crate::memory::MemoryStore;
    use serde_json::json;

    fn requested(payload: serde_json::Value) -> serde_json::Value {
        json!({
            "event_type": TASK_REQUESTED_EVENT,
            "source_id": "kernel",
            "payload": payload,
        })
    }

    #[test]
    fn test_parse_request() {
        let (request, source) = parse_request(json!({
            "event_type": "TaskRequested",
            "source_id": "kernel",
            "payload": {"name": "hello", "task_type": "ping"}
        }))
        .unwrap();
        assert_eq!(request.name, "hello");
        assert_eq!(request.task_type, "ping");
        assert_eq!(source.as_deref(), Some("kernel"));
    }

    #[test]
    fn test_parse_request_rejects_missing_name() {
        assert!(parse_request(json!({"event_type": "TaskRequested", "payload": {}})).is_err());
    }

    #[tokio::test]
    async fn test_kernel_tasks_run_to_completion() {
        let (transport, push) = InProcessTransport::new(|request| match request.method.as_str() {
            "event.submit" => Ok(json!("evt-1")),
            other => Err(format!("unexpected method {other}")),
        });
        let client = Arc::new(KernelClient::new(
            Arc::new(transport),
            &KernelConfig::default(),
        ));
        client.connect().await.unwrap();

        let sink: Arc<dyn HeartbeatSink> = client.clone();
        let runtime = AgentRuntime::with_heartbeat_sink(
            AgentConfig {
                poll_interval_ms: 10,
                ..AgentConfig::default()
            },
            sink,
        );
        let memory = Arc::new(MemoryStore::from_config(MemoryConfig::default()));
        register_memory_handlers(&runtime, Arc::clone(&memory)).await;

        let mut finished = runtime.finished_tasks();
        runtime.start().await.unwrap();

        push.push(requested(json!({"name": "hello", "task_type": "ping"})))
            .await;
        push.push(json!({"event_type": TASK_REQUESTED_EVENT, "payload": {}}))
            .await;
        push.push(requested(json!({
            "name": "remember",
            "task_type": "memory.store",
            "payload": {"key": "greeting", "value": "hello world"}
        })))
        .await;
        push.push(requested(json!({
            "name": "recall",
            "task_type": "memory.search",
            "payload": {"query": "hello"}
        })))
        .await;
        push.close().await;

        let submitted = forward_task_requests(&client, &runtime).await.unwrap();
        assert_eq!(submitted, 3);

        let mut done = Vec::new();
        while done.len() < 3 {
            let task = tokio::time::timeout(Duration::from_secs(5), finished.recv())
                .await
                .unwrap()
                .unwrap();
            done.push(task);
        }
        assert!(done.iter().all(|t| t.status == TaskStatus::Completed));
        assert!(done.iter().all(|t| t.source_id.as_deref() == Some("kernel")));

        let ping = done.iter().find(|t| t.task_type == "ping").unwrap();
        assert_eq!(ping.result.as_ref().unwrap()["pong"], true);
        assert!(memory.retrieve("greeting").await.is_some());

        runtime.stop().await;
        client.disconnect().await;
    }
}
