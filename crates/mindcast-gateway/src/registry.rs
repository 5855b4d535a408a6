//! Connection registry: live client sessions and in-flight request owners.
//!
//! Both tables sit behind one lock. The lock is only held for the map
//! operation itself; sends happen after it is released.
//!
//! Disconnects are detected lazily: a failed send is taken as proof that the
//! connection is gone and the entry is evicted on the spot.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::{RwLock, mpsc};
use tracing::{debug, error, info, warn};

use mindcast_core::protocol::ServerMessage;

/// Outbound half of a client session: serialized messages for its writer task.
pub type Outbound = mpsc::UnboundedSender<String>;

struct Connection {
    generation: u64,
    tx: Outbound,
}

struct PendingRequest {
    conn_id: String,
    registered_at: Instant,
}

#[derive(Default)]
struct Tables {
    connections: HashMap<String, Connection>,
    pending: HashMap<String, PendingRequest>,
}

/// Registry of connected clients and pending request correlations.
pub struct ConnectionRegistry {
    tables: RwLock<Tables>,
    next_generation: AtomicU64,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            next_generation: AtomicU64::new(1),
        }
    }

    /// Install `tx` as the connection for `conn_id`, replacing any previous one.
    ///
    /// Returns the generation of the new entry; pass it to [`release`] when
    /// the session ends so a newer session under the same id is left alone.
    ///
    /// [`release`]: Self::release
    pub async fn register(&self, conn_id: &str, tx: Outbound) -> u64 {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let (replaced, total) = {
            let mut tables = self.tables.write().await;
            let replaced = tables
                .connections
                .insert(conn_id.to_string(), Connection { generation, tx })
                .is_some();
            (replaced, tables.connections.len())
        };
        if replaced {
            warn!(conn_id, "Replaced existing connection with the same id");
        }
        info!(conn_id, total, "Client connected");
        generation
    }

    /// Remove the connection for `conn_id`. Returns false if it was not registered.
    pub async fn unregister(&self, conn_id: &str) -> bool {
        let (removed, total) = {
            let mut tables = self.tables.write().await;
            let removed = tables.connections.remove(conn_id).is_some();
            (removed, tables.connections.len())
        };
        if removed {
            info!(conn_id, total, "Client disconnected");
        }
        removed
    }

    /// Remove the connection for `conn_id` only if it is still `generation`.
    pub async fn release(&self, conn_id: &str, generation: u64) -> bool {
        let (removed, total) = {
            let mut tables = self.tables.write().await;
            let current = tables.connections.get(conn_id).map(|c| c.generation);
            let removed = current == Some(generation);
            if removed {
                tables.connections.remove(conn_id);
            }
            (removed, tables.connections.len())
        };
        if removed {
            info!(conn_id, total, "Client disconnected");
        }
        removed
    }

    /// Deliver `message` to one connection.
    ///
    /// A failed send evicts the connection. Returns whether the message was
    /// handed to the connection.
    pub async fn send_to(&self, conn_id: &str, message: &ServerMessage) -> bool {
        let Some(text) = encode(message) else {
            return false;
        };

        let target = {
            let tables = self.tables.read().await;
            tables
                .connections
                .get(conn_id)
                .map(|c| (c.generation, c.tx.clone()))
        };
        let Some((generation, tx)) = target else {
            debug!(conn_id, "Send to unknown connection dropped");
            return false;
        };

        if tx.send(text).is_ok() {
            return true;
        }
        warn!(conn_id, "Send failed, evicting connection");
        self.release(conn_id, generation).await;
        false
    }

    /// Deliver `message` to every connection except `exclude`.
    ///
    /// Connections whose send fails are evicted once the pass is over.
    /// Returns the number of connections the message was handed to.
    pub async fn broadcast(&self, message: &ServerMessage, exclude: Option<&str>) -> usize {
        let Some(text) = encode(message) else {
            return 0;
        };

        let targets: Vec<(String, u64, Outbound)> = {
            let tables = self.tables.read().await;
            tables
                .connections
                .iter()
                .filter(|(id, _)| Some(id.as_str()) != exclude)
                .map(|(id, c)| (id.clone(), c.generation, c.tx.clone()))
                .collect()
        };

        let mut sent = 0;
        let mut failed = Vec::new();
        for (conn_id, generation, tx) in targets {
            if tx.send(text.clone()).is_ok() {
                sent += 1;
            } else {
                failed.push((conn_id, generation));
            }
        }

        if !failed.is_empty() {
            let mut tables = self.tables.write().await;
            for (conn_id, generation) in &failed {
                if tables.connections.get(conn_id).map(|c| c.generation) == Some(*generation) {
                    tables.connections.remove(conn_id);
                }
            }
            warn!(evicted = failed.len(), "Evicted connections after failed broadcast");
        }
        debug!(sent, exclude, "Broadcast message");
        sent
    }

    /// Record that `conn_id` owns `request_id`.
    ///
    /// Last writer wins: a previous owner of the same id is displaced and
    /// returned.
    pub async fn register_pending_request(&self, request_id: &str, conn_id: &str) -> Option<String> {
        let mut tables = self.tables.write().await;
        tables
            .pending
            .insert(
                request_id.to_string(),
                PendingRequest {
                    conn_id: conn_id.to_string(),
                    registered_at: Instant::now(),
                },
            )
            .map(|previous| previous.conn_id)
    }

    /// Take the owner of `request_id`. Each registration resolves at most once.
    pub async fn resolve_pending_request(&self, request_id: &str) -> Option<String> {
        let mut tables = self.tables.write().await;
        tables.pending.remove(request_id).map(|p| p.conn_id)
    }

    /// Drop pending requests registered more than `max_age` ago.
    pub async fn sweep_pending(&self, max_age: Duration) -> usize {
        let now = Instant::now();
        let mut tables = self.tables.write().await;
        let before = tables.pending.len();
        tables
            .pending
            .retain(|_, p| now.saturating_duration_since(p.registered_at) <= max_age);
        before - tables.pending.len()
    }

    pub async fn is_connected(&self, conn_id: &str) -> bool {
        self.tables.read().await.connections.contains_key(conn_id)
    }

    pub async fn connection_count(&self) -> usize {
        self.tables.read().await.connections.len()
    }

    pub async fn pending_count(&self) -> usize {
        self.tables.read().await.pending.len()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn encode(message: &ServerMessage) -> Option<String> {
    match serde_json::to_string(message) {
        Ok(text) => Some(text),
        Err(e) => {
            error!(%e, "Failed to serialize outbound message");
            None
        }
    }
}
