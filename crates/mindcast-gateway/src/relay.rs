//! Result relay, the single bus listener of a gateway process.
//!
//! Task results go back to the connection that issued the request; successful
//! mutations and domain updates are fanned out to everyone else. A payload
//! that cannot be parsed is logged and skipped, it never stops the relay.

use std::sync::Arc;

use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use mindcast_core::config::ChannelNames;
use mindcast_core::protocol::{ServerMessage, TaskResult, actions, is_state_mutating};
use mindcast_core::{BusMessage, MessageBus, Subscription};

use crate::registry::ConnectionRegistry;

pub struct ResultRelay {
    registry: Arc<ConnectionRegistry>,
    channels: ChannelNames,
}

impl ResultRelay {
    pub fn new(registry: Arc<ConnectionRegistry>, channels: ChannelNames) -> Self {
        Self { registry, channels }
    }

    /// Subscribe to the task-result and domain-update channels.
    pub async fn subscribe(&self, bus: &dyn MessageBus) -> mindcast_core::Result<Subscription> {
        bus.subscribe(&[
            self.channels.results.as_str(),
            self.channels.updates.as_str(),
        ])
        .await
    }

    /// Run the relay on its own task until `cancel` fires or the bus closes.
    pub fn spawn(self, subscription: Subscription, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(subscription, cancel))
    }

    #[tracing::instrument(skip_all, name = "result_relay")]
    pub async fn run(self, mut subscription: Subscription, cancel: CancellationToken) {
        info!(
            results = %self.channels.results,
            updates = %self.channels.updates,
            "Result relay started"
        );
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Result relay stopping");
                    break;
                }
                msg = subscription.next() => match msg {
                    Some(msg) => self.handle(&msg).await,
                    None => {
                        warn!("Bus closed, result relay exiting");
                        break;
                    }
                },
            }
        }
    }

    /// Route one bus message.
    pub async fn handle(&self, msg: &BusMessage) {
        if msg.channel == self.channels.results {
            self.handle_result(&msg.payload).await;
        } else if msg.channel == self.channels.updates {
            self.handle_update(&msg.payload).await;
        } else {
            debug!(channel = %msg.channel, "Ignoring message on unexpected channel");
        }
    }

    async fn handle_result(&self, payload: &str) {
        let result: TaskResult = match serde_json::from_str(payload) {
            Ok(result) => result,
            Err(e) => {
                warn!(channel = %self.channels.results, %e, "Skipping malformed task result");
                return;
            }
        };

        let owner = match result.request_id.as_deref() {
            Some(request_id) => self.registry.resolve_pending_request(request_id).await,
            None => None,
        };

        match (owner.as_deref(), result.request_id.as_deref()) {
            (Some(conn_id), Some(request_id)) => {
                let response = ServerMessage::response(request_id, &result);
                if self.registry.send_to(conn_id, &response).await {
                    debug!(conn_id, request_id, action = %result.action, "Delivered task result");
                } else {
                    debug!(conn_id, request_id, "Originator gone, task result dropped");
                }
            }
            (_, request_id) => {
                debug!(request_id, action = %result.action, "No pending owner for task result");
            }
        }

        if result.is_success() && is_state_mutating(&result.action) {
            let update = ServerMessage::update(
                result.action.clone(),
                result.data.clone().unwrap_or(Value::Null),
            );
            self.registry.broadcast(&update, owner.as_deref()).await;
        }
    }

    async fn handle_update(&self, payload: &str) {
        let data: Value = match serde_json::from_str(payload) {
            Ok(data) => data,
            Err(e) => {
                warn!(channel = %self.channels.updates, %e, "Skipping malformed domain update");
                return;
            }
        };
        let update = ServerMessage::update(actions::MIND_UPDATED, data);
        self.registry.broadcast(&update, None).await;
    }
}
