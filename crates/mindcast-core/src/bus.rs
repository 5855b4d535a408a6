//! Publish/subscribe message bus contract.
//!
//! The bus is a volatile, at-most-once broadcast transport: a message reaches
//! whoever is subscribed to its channel at publish time and is then gone.
//! Order is preserved per publisher on a single channel only.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tracing::{debug, warn};

use crate::error::{MindcastError, Result};
use crate::redis_bus::RedisBus;

/// Default number of in-flight messages a [`MemoryBus`] buffers per subscriber.
pub const DEFAULT_CAPACITY: usize = 1024;

/// A message received from the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub channel: String,
    pub payload: String,
}

impl BusMessage {
    pub fn new(channel: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            payload: payload.into(),
        }
    }
}

/// A live subscription to one or more channels.
pub struct Subscription {
    stream: BoxStream<'static, BusMessage>,
}

impl Subscription {
    pub fn new(stream: BoxStream<'static, BusMessage>) -> Self {
        Self { stream }
    }

    /// Wait for the next message. `None` once the bus has shut down.
    pub async fn next(&mut self) -> Option<BusMessage> {
        self.stream.next().await
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").finish_non_exhaustive()
    }
}

#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Publish `payload` on `channel`, returning how many subscribers got it.
    async fn publish(&self, channel: &str, payload: String) -> Result<usize>;

    /// Subscribe to the given channels.
    async fn subscribe(&self, channels: &[&str]) -> Result<Subscription>;
}

/// Serialize `value` as JSON text and publish it.
pub async fn publish_json<T: Serialize + ?Sized>(
    bus: &dyn MessageBus,
    channel: &str,
    value: &T,
) -> Result<usize> {
    let payload = serde_json::to_string(value)?;
    bus.publish(channel, payload).await
}

/// Open the bus at `url`, or a process-local [`MemoryBus`] when there is none.
///
/// Only a networked bus lets gateways and workers run as separate processes.
pub async fn connect(url: Option<&str>, capacity: usize) -> Result<Arc<dyn MessageBus>> {
    match url {
        Some(url) => Ok(Arc::new(RedisBus::connect(url).await?)),
        None => {
            debug!(capacity, "Using in-process bus");
            Ok(Arc::new(MemoryBus::new(capacity)))
        }
    }
}

/// In-process bus backed by a `tokio::sync::broadcast` channel.
#[derive(Debug, Clone)]
pub struct MemoryBus {
    tx: broadcast::Sender<BusMessage>,
}

impl MemoryBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[async_trait]
impl MessageBus for MemoryBus {
    async fn publish(&self, channel: &str, payload: String) -> Result<usize> {
        match self.tx.send(BusMessage::new(channel, payload)) {
            Ok(receivers) => Ok(receivers),
            // Nobody listening: the message is simply gone.
            Err(_) => {
                debug!(channel, "Published with no subscribers");
                Ok(0)
            }
        }
    }

    async fn subscribe(&self, channels: &[&str]) -> Result<Subscription> {
        if channels.is_empty() {
            return Err(MindcastError::Bus("subscribe needs at least one channel".into()));
        }
        let wanted: HashSet<String> = channels.iter().map(|c| c.to_string()).collect();

        let stream = BroadcastStream::new(self.tx.subscribe()).filter_map(move |item| {
            let keep = match item {
                Ok(msg) if wanted.contains(&msg.channel) => Some(msg),
                Ok(_) => None,
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    warn!(skipped, "Bus subscriber lagged, messages dropped");
                    None
                }
            };
            futures::future::ready(keep)
        });

        Ok(Subscription::new(stream.boxed()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let bus = MemoryBus::default();
        let delivered = bus.publish("tasks", "{}".into()).await.unwrap();
        assert_eq!(delivered, 0);
    }

    #[tokio::test]
    async fn test_subscription_filters_channels() {
        let bus = MemoryBus::default();
        let mut sub = bus.subscribe(&["task_results", "mind_updates"]).await.unwrap();

        bus.publish("tasks", "ignored".into()).await.unwrap();
        bus.publish("task_results", "first".into()).await.unwrap();
        bus.publish("mind_updates", "second".into()).await.unwrap();

        let first = sub.next().await.unwrap();
        assert_eq!(first, BusMessage::new("task_results", "first"));
        let second = sub.next().await.unwrap();
        assert_eq!(second.channel, "mind_updates");
        assert_eq!(second.payload, "second");
    }

    #[tokio::test]
    async fn test_every_subscriber_receives() {
        let bus = MemoryBus::default();
        let mut a = bus.subscribe(&["tasks"]).await.unwrap();
        let mut b = bus.subscribe(&["tasks"]).await.unwrap();

        let delivered = bus.publish("tasks", "t1".into()).await.unwrap();
        assert_eq!(delivered, 2);
        assert_eq!(a.next().await.unwrap().payload, "t1");
        assert_eq!(b.next().await.unwrap().payload, "t1");
    }

    #[tokio::test]
    async fn test_no_replay_for_late_subscribers() {
        let bus = MemoryBus::default();
        let _early = bus.subscribe(&["tasks"]).await.unwrap();
        bus.publish("tasks", "before".into()).await.unwrap();

        let mut late = bus.subscribe(&["tasks"]).await.unwrap();
        bus.publish("tasks", "after".into()).await.unwrap();
        assert_eq!(late.next().await.unwrap().payload, "after");
    }

    #[tokio::test]
    async fn test_lagged_subscriber_keeps_running() {
        let bus = MemoryBus::new(2);
        let mut sub = bus.subscribe(&["tasks"]).await.unwrap();
        for i in 0..5 {
            bus.publish("tasks", format!("m{i}")).await.unwrap();
        }
        // The oldest messages were overwritten; the newest survive.
        let msg = tokio::time::timeout(Duration::from_secs(1), sub.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(msg.payload, "m3");
        assert_eq!(sub.next().await.unwrap().payload, "m4");
    }

    #[tokio::test]
    async fn test_subscribe_requires_channels() {
        let bus = MemoryBus::default();
        assert!(bus.subscribe(&[]).await.is_err());
    }

    #[tokio::test]
    async fn test_connect_without_url_is_in_process() {
        let bus = connect(None, 8).await.unwrap();
        let mut sub = bus.subscribe(&["tasks"]).await.unwrap();
        assert_eq!(bus.publish("tasks", "t1".into()).await.unwrap(), 1);
        assert_eq!(sub.next().await.unwrap().payload, "t1");
    }

    #[tokio::test]
    async fn test_connect_with_bad_url_fails() {
        assert!(connect(Some("not a redis url"), 8).await.is_err());
    }

    #[tokio::test]
    async fn test_publish_json() {
        let bus = MemoryBus::default();
        let mut sub = bus.subscribe(&["mind_updates"]).await.unwrap();
        publish_json(&bus, "mind_updates", &serde_json::json!({"id": 3}))
            .await
            .unwrap();
        let msg = sub.next().await.unwrap();
        let value: serde_json::Value = serde_json::from_str(&msg.payload).unwrap();
        assert_eq!(value["id"], 3);
    }
}
