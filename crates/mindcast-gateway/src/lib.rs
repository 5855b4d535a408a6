//! WebSocket fanout gateway.
//!
//! Bridges connected client sessions to the task executor over the message
//! bus. Each session publishes tasks and gets an immediate preview or ack; a
//! single result relay routes task results back to the originating session
//! and fans state changes out to everybody else.

pub mod registry;
pub mod relay;
pub mod server;
pub mod session;
pub mod state;
pub mod sweeper;

pub use registry::ConnectionRegistry;
pub use relay::ResultRelay;
pub use server::{router, serve_gateway, start_gateway};
pub use session::{SessionError, SessionHandler};
pub use state::GatewayState;
pub use sweeper::PendingSweeper;
