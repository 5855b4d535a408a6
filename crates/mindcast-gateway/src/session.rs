//! WebSocket session lifecycle: registration, read loop, command dispatch.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use mindcast_core::protocol::{
    ClientCommand, ServerMessage, Task, TaskResult, actions, preview_mind,
};
use mindcast_core::publish_json;

use crate::registry::Outbound;
use crate::state::GatewayState;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("malformed command: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("failed to encode reply: {0}")]
    Encode(serde_json::Error),

    #[error("client outbound channel closed")]
    Closed,
}

/// Dispatches the commands of a single client session.
pub struct SessionHandler {
    conn_id: String,
    state: Arc<GatewayState>,
    outbound: Outbound,
}

impl SessionHandler {
    pub fn new(conn_id: impl Into<String>, state: Arc<GatewayState>, outbound: Outbound) -> Self {
        Self {
            conn_id: conn_id.into(),
            state,
            outbound,
        }
    }

    /// Parse and dispatch one raw inbound frame. Returns the correlation id.
    pub async fn handle_text(&self, text: &str) -> Result<String, SessionError> {
        let command: ClientCommand = serde_json::from_str(text)?;
        self.dispatch(command).await
    }

    /// Register the correlation, reply immediately, then hand the work to the bus.
    pub async fn dispatch(&self, command: ClientCommand) -> Result<String, SessionError> {
        let request_id = command
            .request_id()
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let registry = &self.state.registry;

        if let Some(previous) = registry
            .register_pending_request(&request_id, &self.conn_id)
            .await
        {
            warn!(%request_id, previous = %previous, conn_id = %self.conn_id,
                "Request id reused, previous owner displaced");
        }

        let reply = if command.action == actions::UPSERT_MIND {
            let mind = preview_mind(&command.data, Utc::now());
            ServerMessage::preview(&request_id, &command.action, mind)
        } else {
            ServerMessage::ack(&request_id, &command.action)
        };
        if let Err(e) = self.send(&reply) {
            // The task is never published, so nothing would resolve this entry.
            registry.resolve_pending_request(&request_id).await;
            return Err(e);
        }

        let task = Task::new(command.action, command.data, &request_id, &self.conn_id);
        match publish_json(self.state.bus.as_ref(), &self.state.channels.tasks, &task).await {
            Ok(0) => {
                warn!(%request_id, action = %task.action, "Task published but no executor is listening");
            }
            Ok(_) => {
                debug!(%request_id, action = %task.action, conn_id = %self.conn_id, "Task published");
            }
            Err(e) => {
                error!(%request_id, action = %task.action, %e, "Failed to publish task");
                // Nothing will ever answer this request; settle it now.
                if registry.resolve_pending_request(&request_id).await.is_some() {
                    let result = TaskResult::error(&task, format!("Failed to publish task: {e}"));
                    self.send(&ServerMessage::response(&request_id, &result))?;
                }
            }
        }

        Ok(request_id)
    }

    fn send(&self, message: &ServerMessage) -> Result<(), SessionError> {
        let text = serde_json::to_string(message).map_err(SessionError::Encode)?;
        self.outbound.send(text).map_err(|_| SessionError::Closed)
    }
}

/// Run a WebSocket session for `conn_id` until the client goes away.
pub async fn handle_ws_connection(state: Arc<GatewayState>, conn_id: String, ws: WebSocket) {
    let (mut ws_tx, mut ws_rx) = ws.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();

    let generation = state
        .registry
        .register(&conn_id, outbound_tx.clone())
        .await;

    // Writer task: the only place that touches the socket's send half.
    let send_task = tokio::spawn(async move {
        while let Some(msg) = outbound_rx.recv().await {
            if ws_tx.send(Message::Text(msg.into())).await.is_err() {
                break;
            }
        }
    });

    let handler = SessionHandler::new(conn_id.clone(), state.clone(), outbound_tx);

    while let Some(msg_result) = ws_rx.next().await {
        let text = match msg_result {
            Ok(Message::Text(text)) => text.to_string(),
            Ok(Message::Binary(bytes)) => match String::from_utf8(bytes.to_vec()) {
                Ok(text) => text,
                Err(_) => {
                    warn!(conn_id = %conn_id, "Ignoring non-UTF-8 binary frame");
                    continue;
                }
            },
            Ok(Message::Close(_)) => {
                debug!(conn_id = %conn_id, "Client requested close");
                break;
            }
            Ok(_) => continue,
            Err(e) => {
                warn!(conn_id = %conn_id, %e, "WebSocket error");
                break;
            }
        };

        match handler.handle_text(&text).await {
            Ok(_) => {}
            Err(SessionError::Closed) => {
                debug!(conn_id = %conn_id, "Outbound channel closed");
                break;
            }
            Err(e) => {
                warn!(conn_id = %conn_id, %e, "Discarding inbound message");
            }
        }
    }

    send_task.abort();
    state.registry.release(&conn_id, generation).await;
    info!(conn_id = %conn_id, "WebSocket session closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use mindcast_core::config::Config;
    use mindcast_core::error::{MindcastError, Result as CoreResult};
    use mindcast_core::{MemoryBus, MessageBus, Subscription};
    use serde_json::{Value, json};
    use std::time::Duration;

    struct FailingBus;

    #[async_trait]
    impl MessageBus for FailingBus {
        async fn publish(&self, _channel: &str, _payload: String) -> CoreResult<usize> {
            Err(MindcastError::Bus("down".into()))
        }

        async fn subscribe(&self, _channels: &[&str]) -> CoreResult<Subscription> {
            Err(MindcastError::Bus("down".into()))
        }
    }

    fn make_state(bus: Arc<dyn MessageBus>) -> Arc<GatewayState> {
        Arc::new(GatewayState::new(Arc::new(Config::default()), bus))
    }

    fn next_json(rx: &mut mpsc::UnboundedReceiver<String>) -> Value {
        serde_json::from_str(&rx.try_recv().expect("expected an outbound message")).unwrap()
    }

    #[tokio::test]
    async fn test_upsert_sends_preview_and_publishes_task() {
        let bus = Arc::new(MemoryBus::default());
        let mut tasks = bus.subscribe(&["tasks"]).await.unwrap();
        let state = make_state(bus);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handler = SessionHandler::new("alice", state.clone(), tx);

        let request_id = handler
            .handle_text(r#"{"action": "upsert_mind", "data": {"name": "Foo"}, "request_id": "r1"}"#)
            .await
            .unwrap();
        assert_eq!(request_id, "r1");

        let preview = next_json(&mut rx);
        assert_eq!(preview["type"], "preview");
        assert_eq!(preview["request_id"], "r1");
        assert_eq!(preview["status"], "saving");
        assert_eq!(preview["data"]["mind"]["id"], "pending");
        assert_eq!(preview["data"]["mind"]["name"], "Foo");
        assert_eq!(preview["data"]["mind"]["_status"], "saving");

        let published = tasks.next().await.unwrap();
        let task: Task = serde_json::from_str(&published.payload).unwrap();
        assert_eq!(task.action, "upsert_mind");
        assert_eq!(task.request_id, "r1");
        assert_eq!(task.user_id, "alice");
        assert_eq!(task.data, json!({"name": "Foo"}));

        assert_eq!(
            state.registry.resolve_pending_request("r1").await.as_deref(),
            Some("alice")
        );
    }

    #[tokio::test]
    async fn test_other_actions_get_ack() {
        let bus = Arc::new(MemoryBus::default());
        let _tasks = bus.subscribe(&["tasks"]).await.unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handler = SessionHandler::new("bob", make_state(bus), tx);

        handler
            .handle_text(r#"{"action": "get_mind", "data": {"mind_id_list": [1]}, "request_id": "r2"}"#)
            .await
            .unwrap();

        let ack = next_json(&mut rx);
        assert_eq!(
            ack,
            json!({"type": "ack", "request_id": "r2", "action": "get_mind", "status": "processing"})
        );
    }

    #[tokio::test]
    async fn test_missing_request_id_is_generated() {
        let bus = Arc::new(MemoryBus::default());
        let state = make_state(bus);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handler = SessionHandler::new("carol", state.clone(), tx);

        let first = handler.handle_text(r#"{"action": "list_minds"}"#).await.unwrap();
        let second = handler.handle_text(r#"{"action": "list_minds"}"#).await.unwrap();
        assert_ne!(first, second);
        assert!(Uuid::parse_str(&first).is_ok());

        assert_eq!(next_json(&mut rx)["request_id"], first.as_str());
        assert_eq!(state.registry.pending_count().await, 2);
    }

    #[tokio::test]
    async fn test_malformed_message_is_rejected_without_side_effects() {
        let state = make_state(Arc::new(MemoryBus::default()));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handler = SessionHandler::new("dave", state.clone(), tx);

        let err = handler.handle_text("not json").await.unwrap_err();
        assert!(matches!(err, SessionError::Malformed(_)));
        let err = handler.handle_text(r#"{"data": {}}"#).await.unwrap_err();
        assert!(matches!(err, SessionError::Malformed(_)));

        assert!(rx.try_recv().is_err());
        assert_eq!(state.registry.pending_count().await, 0);

        // The handler keeps working afterwards.
        assert!(handler.handle_text(r#"{"action": "list_minds"}"#).await.is_ok());
    }

    #[tokio::test]
    async fn test_closed_outbound_terminates_without_leaking() {
        let bus = Arc::new(MemoryBus::default());
        let mut tasks = bus.subscribe(&["tasks"]).await.unwrap();
        let state = make_state(bus.clone());
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let handler = SessionHandler::new("erin", state.clone(), tx);

        let err = handler
            .handle_text(r#"{"action": "list_minds", "request_id": "r1"}"#)
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Closed));
        assert_eq!(state.registry.pending_count().await, 0);
        let published = tokio::time::timeout(Duration::from_millis(50), tasks.next()).await;
        assert!(published.is_err(), "no task should be published");
    }

    #[tokio::test]
    async fn test_publish_failure_settles_request() {
        let state = make_state(Arc::new(FailingBus));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handler = SessionHandler::new("frank", state.clone(), tx);

        handler
            .handle_text(r#"{"action": "append_mental", "data": {"mind_id": 1}, "request_id": "r5"}"#)
            .await
            .unwrap();

        assert_eq!(next_json(&mut rx)["type"], "ack");
        let response = next_json(&mut rx);
        assert_eq!(response["type"], "response");
        assert_eq!(response["request_id"], "r5");
        assert_eq!(response["status"], "error");
        assert!(response["error"].as_str().unwrap().contains("down"));
        assert_eq!(state.registry.pending_count().await, 0);
    }
}
