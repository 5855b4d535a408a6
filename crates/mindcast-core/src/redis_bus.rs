//! Redis pub/sub bus, shared by gateways and workers running as separate processes.

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::MultiplexedConnection;
use tracing::{info, warn};

use crate::bus::{BusMessage, MessageBus, Subscription};
use crate::error::{MindcastError, Result};

/// Bus backed by Redis `PUBLISH`/`SUBSCRIBE`.
///
/// Publishing goes through one multiplexed connection. Every subscription
/// opens its own pub/sub connection, since Redis parks a subscribed
/// connection in push mode.
#[derive(Clone)]
pub struct RedisBus {
    client: redis::Client,
    publisher: MultiplexedConnection,
}

impl RedisBus {
    /// Connect to the Redis server at `url` (e.g. `redis://localhost:6379/0`).
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).map_err(bus_error)?;
        let publisher = client
            .get_multiplexed_async_connection()
            .await
            .map_err(bus_error)?;
        info!("Connected to Redis bus");
        Ok(Self { client, publisher })
    }
}

impl std::fmt::Debug for RedisBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBus").finish_non_exhaustive()
    }
}

fn bus_error(e: redis::RedisError) -> MindcastError {
    MindcastError::Bus(e.to_string())
}

#[async_trait]
impl MessageBus for RedisBus {
    async fn publish(&self, channel: &str, payload: String) -> Result<usize> {
        let mut conn = self.publisher.clone();
        let receivers: usize = redis::cmd("PUBLISH")
            .arg(channel)
            .arg(payload)
            .query_async(&mut conn)
            .await
            .map_err(bus_error)?;
        Ok(receivers)
    }

    async fn subscribe(&self, channels: &[&str]) -> Result<Subscription> {
        if channels.is_empty() {
            return Err(MindcastError::Bus("subscribe needs at least one channel".into()));
        }

        let mut pubsub = self.client.get_async_pubsub().await.map_err(bus_error)?;
        for channel in channels {
            pubsub.subscribe(*channel).await.map_err(bus_error)?;
        }

        let stream = pubsub.into_on_message().filter_map(|msg| {
            let channel = msg.get_channel_name().to_string();
            let item = match msg.get_payload::<String>() {
                Ok(payload) => Some(BusMessage { channel, payload }),
                Err(e) => {
                    warn!(%channel, %e, "Skipping non-text bus payload");
                    None
                }
            };
            futures::future::ready(item)
        });

        Ok(Subscription::new(stream.boxed()))
    }
}
