//! Task worker loop: task channel in, task-result channel out.

use std::sync::Arc;

use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use mindcast_core::config::ChannelNames;
use mindcast_core::protocol::{Task, TaskResult};
use mindcast_core::{MessageBus, Subscription, publish_json};

use crate::executor::TaskExecutor;

/// Consumes tasks one at a time, in arrival order.
pub struct TaskWorker {
    bus: Arc<dyn MessageBus>,
    executor: Arc<dyn TaskExecutor>,
    channels: ChannelNames,
}

impl TaskWorker {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        executor: Arc<dyn TaskExecutor>,
        channels: ChannelNames,
    ) -> Self {
        Self {
            bus,
            executor,
            channels,
        }
    }

    pub async fn subscribe(&self) -> mindcast_core::Result<Subscription> {
        self.bus.subscribe(&[self.channels.tasks.as_str()]).await
    }

    pub fn spawn(self, subscription: Subscription, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(subscription, cancel))
    }

    #[tracing::instrument(skip_all, name = "task_worker")]
    pub async fn run(self, mut subscription: Subscription, cancel: CancellationToken) {
        info!(channel = %self.channels.tasks, "Task worker started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Task worker stopping");
                    break;
                }
                msg = subscription.next() => match msg {
                    Some(msg) => {
                        self.process(&msg.payload).await;
                    }
                    None => {
                        warn!("Bus closed, task worker exiting");
                        break;
                    }
                },
            }
        }
    }

    /// Execute one raw task payload and publish its result.
    ///
    /// A payload that names a request id is always answered, with an error
    /// result if it cannot be decoded as a task. Returns `None` only for
    /// payloads that are not JSON or carry no request id.
    pub async fn process(&self, payload: &str) -> Option<TaskResult> {
        let value: Value = match serde_json::from_str(payload) {
            Ok(value) => value,
            Err(e) => {
                warn!(%e, "Skipping non-JSON task payload");
                return None;
            }
        };

        let result = match serde_json::from_value::<Task>(value.clone()) {
            Ok(task) => self.executor.execute(&task).await,
            Err(e) => {
                let Some(request_id) = value
                    .get("request_id")
                    .and_then(Value::as_str)
                    .filter(|id| !id.is_empty())
                else {
                    warn!(%e, "Skipping task without a request id");
                    return None;
                };
                let action = value.get("action").and_then(Value::as_str).unwrap_or_default();
                warn!(request_id, action, %e, "Rejecting undecodable task");
                TaskResult::rejected(request_id, action, format!("Invalid task: {e}"))
            }
        };

        let request_id = result.request_id.as_deref().unwrap_or_default();
        match publish_json(self.bus.as_ref(), &self.channels.results, &result).await {
            Ok(_) => debug!(request_id, action = %result.action, "Result published"),
            Err(e) => error!(request_id, %e, "Failed to publish task result"),
        }
        Some(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use mindcast_core::MemoryBus;
    use serde_json::json;
    use std::time::Duration;

    /// Succeeds for `list_minds`, fails for everything else.
    struct FakeExecutor;

    #[async_trait]
    impl TaskExecutor for FakeExecutor {
        async fn execute(&self, task: &Task) -> TaskResult {
            if task.action == "list_minds" {
                TaskResult::success(task, json!({"minds": [], "count": 0}))
            } else {
                TaskResult::error(task, format!("Unknown action: {}", task.action))
            }
        }
    }

    fn worker(bus: Arc<MemoryBus>) -> TaskWorker {
        TaskWorker::new(bus, Arc::new(FakeExecutor), ChannelNames::default())
    }

    fn task_payload(action: &str, request_id: &str) -> String {
        serde_json::to_string(&Task::new(action, json!({}), request_id, "alice")).unwrap()
    }

    #[tokio::test]
    async fn test_process_publishes_result() {
        let bus = Arc::new(MemoryBus::default());
        let mut results = bus.subscribe(&["task_results"]).await.unwrap();
        let worker = worker(bus.clone());

        let result = worker.process(&task_payload("list_minds", "r1")).await.unwrap();
        assert!(result.is_success());

        let msg = results.next().await.unwrap();
        let published: TaskResult = serde_json::from_str(&msg.payload).unwrap();
        assert_eq!(published, result);
        assert_eq!(published.request_id.as_deref(), Some("r1"));
    }

    #[tokio::test]
    async fn test_unknown_action_still_answers() {
        let bus = Arc::new(MemoryBus::default());
        let mut results = bus.subscribe(&["task_results"]).await.unwrap();
        let worker = worker(bus.clone());

        worker.process(&task_payload("nope", "r2")).await.unwrap();
        let msg = results.next().await.unwrap();
        let value: Value = serde_json::from_str(&msg.payload).unwrap();
        assert_eq!(value["status"], "error");
        assert_eq!(value["request_id"], "r2");
        assert_eq!(value["error"], "Unknown action: nope");
    }

    #[tokio::test]
    async fn test_payload_without_request_id_is_skipped() {
        let bus = Arc::new(MemoryBus::default());
        let worker = worker(bus);
        assert!(worker.process("{{").await.is_none());
        assert!(worker.process(r#"{"action": "list_minds"}"#).await.is_none());
    }

    #[tokio::test]
    async fn test_task_without_timestamp_is_executed() {
        let bus = Arc::new(MemoryBus::default());
        let mut results = bus.subscribe(&["task_results"]).await.unwrap();
        let worker = worker(bus.clone());

        let result = worker
            .process(r#"{"action": "list_minds", "data": {}, "request_id": "r9", "user_id": "a"}"#)
            .await
            .unwrap();
        assert!(result.is_success());

        let msg = results.next().await.unwrap();
        let published: TaskResult = serde_json::from_str(&msg.payload).unwrap();
        assert_eq!(published.request_id.as_deref(), Some("r9"));
    }

    #[tokio::test]
    async fn test_offsetless_timestamp_is_executed() {
        let bus = Arc::new(MemoryBus::default());
        let worker = worker(bus);
        let result = worker
            .process(
                r#"{"action": "list_minds", "request_id": "r10", "user_id": "a",
                    "timestamp": "2024-05-01T12:30:00.123456"}"#,
            )
            .await
            .unwrap();
        assert!(result.is_success());
    }

    #[tokio::test]
    async fn test_undecodable_task_is_answered_with_error() {
        let bus = Arc::new(MemoryBus::default());
        let mut results = bus.subscribe(&["task_results"]).await.unwrap();
        let worker = worker(bus.clone());

        let result = worker
            .process(r#"{"action": 5, "request_id": "r11"}"#)
            .await
            .unwrap();
        assert!(!result.is_success());

        let msg = results.next().await.unwrap();
        let value: Value = serde_json::from_str(&msg.payload).unwrap();
        assert_eq!(value["request_id"], "r11");
        assert_eq!(value["status"], "error");
        assert_eq!(value["action"], "");
        assert!(value["error"].as_str().unwrap().starts_with("Invalid task"));

        let result = worker
            .process(r#"{"request_id": "r12", "action": "get_mind", "timestamp": "soon"}"#)
            .await
            .unwrap();
        assert_eq!(result.action, "get_mind");
        assert_eq!(result.request_id.as_deref(), Some("r12"));
    }

    #[tokio::test]
    async fn test_run_loop_processes_in_order() {
        let bus = Arc::new(MemoryBus::default());
        let mut results = bus.subscribe(&["task_results"]).await.unwrap();
        let worker = worker(bus.clone());
        let subscription = worker.subscribe().await.unwrap();
        let cancel = CancellationToken::new();
        let handle = worker.spawn(subscription, cancel.clone());

        bus.publish("tasks", "junk".into()).await.unwrap();
        bus.publish("tasks", task_payload("list_minds", "a")).await.unwrap();
        bus.publish("tasks", task_payload("get_mind", "b")).await.unwrap();

        for expected in ["a", "b"] {
            let msg = tokio::time::timeout(Duration::from_secs(2), results.next())
                .await
                .unwrap()
                .unwrap();
            let result: TaskResult = serde_json::from_str(&msg.payload).unwrap();
            assert_eq!(result.request_id.as_deref(), Some(expected));
        }

        cancel.cancel();
        handle.await.unwrap();
    }
}
