//! Pending-request sweeper.
//!
//! A task that never produces a result would otherwise leave its correlation
//! entry behind forever. The sweeper periodically drops entries older than
//! the configured TTL.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::registry::ConnectionRegistry;

pub struct PendingSweeper {
    registry: Arc<ConnectionRegistry>,
    ttl: Duration,
    interval: Duration,
}

impl PendingSweeper {
    pub fn new(registry: Arc<ConnectionRegistry>, ttl: Duration, interval: Duration) -> Self {
        Self {
            registry,
            ttl,
            interval,
        }
    }

    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(cancel))
    }

    pub async fn run(self, cancel: CancellationToken) {
        info!(ttl_secs = self.ttl.as_secs(), "Pending-request sweeper started");
        let mut interval = tokio::time::interval(self.interval);
        // The first tick completes immediately; nothing can be stale yet.
        interval.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    let swept = self.registry.sweep_pending(self.ttl).await;
                    if swept > 0 {
                        info!(swept, "Dropped stale pending requests");
                    } else {
                        debug!("No stale pending requests");
                    }
                }
            }
        }
    }
}
