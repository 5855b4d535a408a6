//! Gateway shared state.

use std::sync::Arc;

use mindcast_core::MessageBus;
use mindcast_core::config::{ChannelNames, Config};

use crate::registry::ConnectionRegistry;

/// Shared gateway state accessible from all sessions and background workers.
pub struct GatewayState {
    pub config: Arc<Config>,
    pub registry: Arc<ConnectionRegistry>,
    pub bus: Arc<dyn MessageBus>,
    pub channels: ChannelNames,
}

impl GatewayState {
    pub fn new(config: Arc<Config>, bus: Arc<dyn MessageBus>) -> Self {
        let channels = config.channels();
        Self {
            config,
            registry: Arc::new(ConnectionRegistry::new()),
            bus,
            channels,
        }
    }
}
