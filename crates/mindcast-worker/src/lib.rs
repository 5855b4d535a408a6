//! Task executor side of the bus.
//!
//! Consumes tasks published by gateways, performs the named action and
//! publishes exactly one result per task.

pub mod executor;
pub mod http;
pub mod worker;

pub use executor::TaskExecutor;
pub use http::HttpTaskExecutor;
pub use worker::TaskWorker;
