//! Shared message shapes, bus contract, config and errors for Mindcast.

pub mod bus;
pub mod config;
pub mod error;
pub mod protocol;
pub mod redis_bus;

pub use bus::{BusMessage, MemoryBus, MessageBus, Subscription, publish_json};
pub use error::{MindcastError, Result};
pub use redis_bus::RedisBus;
