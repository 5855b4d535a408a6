use async_trait::async_trait;

use mindcast_core::protocol::{Task, TaskResult};

/// Performs the domain operation a [`Task`] names.
///
/// Implementations must answer every task, including ones whose action they
/// do not recognize, so the gateway's pending request is always settled.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, task: &Task) -> TaskResult;
}
