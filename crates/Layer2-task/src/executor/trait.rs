//! Executor trait

use crate::executor::StreamProtocol;
use crate::task::Subtask;
use async_trait::async_trait;
use relay_foundation::Result;

/// What an executor did when asked to stop
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CancelAck {
    /// Local stream protocol whose signal was fired
    pub stopped_stream: Option<StreamProtocol>,
}

/// Executor trait - one per execution path (local stream, remote agent).
///
/// Output is observed through the persistence bridge, not through the
/// executor.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Hand the subtask off; returns once it is running or queued
    async fn start(&self, subtask: &Subtask) -> Result<()>;

    /// Ask the running work to stop (best effort). Recording the terminal
    /// state is left to the caller.
    async fn cancel(&self, subtask: &Subtask) -> Result<CancelAck>;

    /// Get executor name
    fn name(&self) -> &'static str;
}
