//! Cancellation coordinator
//!
//! The path is taken from the subtask's stored execution target:
//!
//! ```text
//! cancel(id) ─► load subtask ─► terminal? ─► AlreadyTerminal (no write)
//!                                  │
//!                  ┌───────────────┴───────────────┐
//!                Local                           Remote
//!      local executor .cancel()      remote executor .cancel()
//!                  └───────────────┬───────────────┘   (failure logged)
//!                                  ▼
//!                finalize: CANCELLED, progress 100, partial result kept
//! ```

use crate::bridge::{ApplyOutcome, PersistenceBridge};
use crate::executor::{Executor, StreamProtocol};
use crate::task::{ExecutionTarget, Subtask, SubtaskId};
use relay_foundation::event::{executor as executor_events, subtask as subtask_events};
use relay_foundation::{Error, Result};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelPath {
    Local,
    Remote,
}

impl CancelPath {
    pub fn as_str(&self) -> &'static str {
        match self {
            CancelPath::Local => "local",
            CancelPath::Remote => "remote",
        }
    }
}

#[derive(Debug, Clone)]
pub enum CancelOutcome {
    Cancelled {
        path: CancelPath,
        subtask: Subtask,
        /// Local stream protocol that held the subtask, if any was live
        stopped_stream: Option<StreamProtocol>,
        /// Remote cancel failure, logged but not fatal
        remote_error: Option<String>,
    },
    /// Nothing was written
    AlreadyTerminal(Subtask),
}

impl CancelOutcome {
    pub fn subtask(&self) -> &Subtask {
        match self {
            CancelOutcome::Cancelled { subtask, .. } | CancelOutcome::AlreadyTerminal(subtask) => {
                subtask
            }
        }
    }
}

/// Cancels subtasks through the executor of their stored target
pub struct CancellationCoordinator {
    bridge: Arc<PersistenceBridge>,
    local: Option<Arc<dyn Executor>>,
    remote: Option<Arc<dyn Executor>>,
}

impl CancellationCoordinator {
    pub fn new(bridge: Arc<PersistenceBridge>) -> Self {
        Self {
            bridge,
            local: None,
            remote: None,
        }
    }

    pub fn with_local_executor(mut self, executor: Arc<dyn Executor>) -> Self {
        self.local = Some(executor);
        self
    }

    pub fn with_remote_executor(mut self, executor: Arc<dyn Executor>) -> Self {
        self.remote = Some(executor);
        self
    }

    pub async fn cancel(&self, id: SubtaskId) -> Result<CancelOutcome> {
        let subtask = self.bridge.get_subtask(id).await?;
        if subtask.is_terminal() {
            info!(subtask_id = %id, status = %subtask.status, "Cancel of terminal subtask ignored");
            return Ok(CancelOutcome::AlreadyTerminal(subtask));
        }

        let (path, stopped_stream, remote_error) = match &subtask.target {
            ExecutionTarget::Local => {
                let stopped = self.cancel_local(&subtask).await;
                (CancelPath::Local, stopped, None)
            }
            ExecutionTarget::Remote { .. } => {
                let remote_error = self.cancel_remote(&subtask).await.err();
                (CancelPath::Remote, None, remote_error)
            }
        };

        match self.bridge.finalize_cancel(id).await? {
            ApplyOutcome::Applied(subtask) => {
                info!(
                    subtask_id = %id,
                    task_id = %subtask.task_id,
                    path = path.as_str(),
                    "Subtask cancelled"
                );
                self.bridge
                    .events()
                    .publish(subtask_events::cancelled(
                        subtask.task_id.0,
                        id.0,
                        path.as_str(),
                    ))
                    .await;
                Ok(CancelOutcome::Cancelled {
                    path,
                    subtask,
                    stopped_stream,
                    remote_error,
                })
            }
            // Finished on its own while we were signalling
            ApplyOutcome::IgnoredTerminal(subtask) | ApplyOutcome::Unchanged(subtask) => {
                info!(subtask_id = %id, status = %subtask.status, "Subtask reached a terminal state before cancel");
                Ok(CancelOutcome::AlreadyTerminal(subtask))
            }
        }
    }

    /// No local executor means no stream of this process can own the subtask
    async fn cancel_local(&self, subtask: &Subtask) -> Option<StreamProtocol> {
        let Some(executor) = &self.local else {
            debug!(subtask_id = %subtask.id, "No local executor configured");
            return None;
        };
        match executor.cancel(subtask).await {
            Ok(ack) => ack.stopped_stream,
            Err(e) => {
                warn!(subtask_id = %subtask.id, error = %e, "Local cancel failed; finalizing anyway");
                None
            }
        }
    }

    async fn cancel_remote(&self, subtask: &Subtask) -> std::result::Result<(), String> {
        let result = match &self.remote {
            Some(executor) => executor.cancel(subtask).await.map(|_| ()),
            None => Err(Error::Executor("no remote executor configured".into())),
        };

        match result {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(
                    subtask_id = %subtask.id,
                    task_id = %subtask.task_id,
                    executor = ?subtask.executor(),
                    error = %e,
                    "Remote cancel failed; finalizing anyway"
                );
                let message = e.to_string();
                self.bridge
                    .events()
                    .publish(executor_events::cancel_failed(subtask.task_id.0, &message))
                    .await;
                Err(message)
            }
        }
    }
}
