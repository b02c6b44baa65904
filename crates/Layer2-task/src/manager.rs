//! Subtask Manager - entry point for task and turn lifecycle
//!
//! Features:
//! - Task creation with an optional task type
//! - Turns: a COMPLETED user subtask followed by a PENDING assistant subtask
//! - Dispatch routed by execution target (local stream or remote agent)
//! - Cancel and retry
//! - Live observation of a subtask's chunks

use crate::bridge::PersistenceBridge;
use crate::cancel::{CancelOutcome, CancellationCoordinator};
use crate::chunk::Chunk;
use crate::executor::Executor;
use crate::state::Status;
use crate::task::{ExecutionTarget, Subtask, SubtaskId, SubtaskRole, Task, TaskId};
use chrono::Utc;
use futures::Stream;
use relay_foundation::{Error, Result};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// The two subtasks a turn creates
#[derive(Debug, Clone)]
pub struct Turn {
    pub user: Subtask,
    pub assistant: Subtask,
}

/// Task and subtask lifecycle
pub struct SubtaskManager {
    bridge: Arc<PersistenceBridge>,

    /// Routes cancels to the same executors dispatch uses
    cancel: CancellationCoordinator,

    /// In-process streaming executor
    local: Option<Arc<dyn Executor>>,

    /// Remote agent executor
    remote: Option<Arc<dyn Executor>>,

    /// Serializes the "no active subtask" check with the writes that follow it
    turn_lock: Mutex<()>,
}

impl SubtaskManager {
    pub fn new(bridge: Arc<PersistenceBridge>) -> Self {
        Self {
            cancel: CancellationCoordinator::new(Arc::clone(&bridge)),
            bridge,
            local: None,
            remote: None,
            turn_lock: Mutex::new(()),
        }
    }

    pub fn with_local_executor(mut self, executor: Arc<dyn Executor>) -> Self {
        self.cancel = self.cancel.with_local_executor(Arc::clone(&executor));
        self.local = Some(executor);
        self
    }

    pub fn with_remote_executor(mut self, executor: Arc<dyn Executor>) -> Self {
        self.cancel = self.cancel.with_remote_executor(Arc::clone(&executor));
        self.remote = Some(executor);
        self
    }

    pub fn bridge(&self) -> &Arc<PersistenceBridge> {
        &self.bridge
    }

    // ========================================================================
    // Tasks and turns
    // ========================================================================

    pub async fn create_task(&self, user_id: i64, task_type: Option<&str>) -> Result<Task> {
        let mut task = Task::new(user_id);
        if let Some(task_type) = task_type {
            task.set_task_type(task_type);
        }

        let store = self.bridge.store();
        let task = self.bridge.pool().run(move || store.insert_task(task)).await?;
        info!(task_id = %task.id, user_id, task_type = ?task.task_type(), "Task created");
        Ok(task)
    }

    /// Record the user's message and queue the assistant's reply.
    ///
    /// Rejected while another subtask of the task is still active.
    pub async fn begin_turn(
        &self,
        task_id: TaskId,
        prompt: impl Into<String>,
        target: ExecutionTarget,
    ) -> Result<Turn> {
        let prompt = prompt.into();
        let _guard = self.turn_lock.lock().await;

        // Existence check before listing, so a bad id is NotFound
        self.bridge.get_task(task_id).await?;
        let existing = self.bridge.list_subtasks(task_id).await?;
        if let Some(active) = existing.iter().find(|s| !s.deleted && !s.is_terminal()) {
            return Err(Error::InvalidInput(format!(
                "task {} already has subtask {} in {}",
                task_id, active.id, active.status
            )));
        }
        let message_id = existing.iter().map(|s| s.message_id).max().unwrap_or(0) + 1;

        let now = Utc::now();
        let mut user = Subtask::new(task_id, SubtaskRole::User, message_id).with_prompt(prompt.clone());
        user.result.content.apply(0, &prompt);
        user.status = Status::Completed;
        user.progress = 100;
        user.completed_at = Some(now);

        let assistant = Subtask::new(task_id, SubtaskRole::Assistant, message_id + 1)
            .with_prompt(prompt)
            .with_target(target);

        let store = self.bridge.store();
        let (user, assistant) = self
            .bridge
            .pool()
            .run(move || {
                let user = store.insert_subtask(user)?;
                let assistant = store.insert_subtask(assistant)?;
                Ok((user, assistant))
            })
            .await?;

        self.bridge.refresh_task_status(task_id, None).await?;
        info!(
            task_id = %task_id,
            user_subtask = %user.id,
            assistant_subtask = %assistant.id,
            remote = assistant.target.is_remote(),
            "Turn started"
        );
        Ok(Turn { user, assistant })
    }

    // ========================================================================
    // Execution
    // ========================================================================

    fn executor_for(&self, target: &ExecutionTarget) -> Result<&Arc<dyn Executor>> {
        let (executor, kind) = match target {
            ExecutionTarget::Local => (&self.local, "local"),
            ExecutionTarget::Remote { .. } => (&self.remote, "remote"),
        };
        executor
            .as_ref()
            .ok_or_else(|| Error::Executor(format!("no {} executor configured", kind)))
    }

    /// Hand a PENDING subtask to the executor for its target
    pub async fn dispatch(&self, id: SubtaskId) -> Result<Subtask> {
        let subtask = self.bridge.get_subtask(id).await?;
        if subtask.is_terminal() {
            return Err(Error::transition(subtask.status, Status::Running));
        }

        let executor = self.executor_for(&subtask.target)?;
        debug!(subtask_id = %id, executor = executor.name(), "Dispatching subtask");
        executor.start(&subtask).await?;
        self.bridge.get_subtask(id).await
    }

    pub async fn cancel(&self, id: SubtaskId) -> Result<CancelOutcome> {
        self.cancel.cancel(id).await
    }

    /// Reset a FAILED or CANCELLED subtask and dispatch it again.
    ///
    /// Only the latest assistant subtask of a task can be retried, and only
    /// while no other subtask of the task is active.
    pub async fn retry(&self, id: SubtaskId) -> Result<Subtask> {
        let guard = self.turn_lock.lock().await;

        let subtask = self.bridge.get_subtask(id).await?;
        let siblings = self.bridge.list_subtasks(subtask.task_id).await?;
        if let Some(active) = siblings
            .iter()
            .find(|s| s.id != id && !s.deleted && !s.is_terminal())
        {
            return Err(Error::InvalidInput(format!(
                "task {} already has subtask {} in {}",
                subtask.task_id, active.id, active.status
            )));
        }
        let latest = siblings
            .iter()
            .filter(|s| s.role == SubtaskRole::Assistant && !s.deleted)
            .max_by_key(|s| s.message_id);
        if latest.map(|s| s.id) != Some(id) {
            return Err(Error::InvalidInput(format!(
                "subtask {} is not the latest assistant reply of task {}",
                id, subtask.task_id
            )));
        }

        let subtask = self.bridge.reset_for_retry(id).await?;
        drop(guard);

        info!(subtask_id = %id, task_id = %subtask.task_id, "Retrying subtask");
        self.dispatch(id).await
    }

    // ========================================================================
    // Reads
    // ========================================================================

    pub async fn get_task(&self, id: TaskId) -> Result<Task> {
        self.bridge.get_task(id).await
    }

    pub async fn get_subtask(&self, id: SubtaskId) -> Result<Subtask> {
        self.bridge.get_subtask(id).await
    }

    pub async fn list_subtasks(&self, task_id: TaskId) -> Result<Vec<Subtask>> {
        self.bridge.list_subtasks(task_id).await
    }

    /// Live chunks for `id`, ending after its terminal status chunk
    pub fn observe(&self, id: SubtaskId) -> impl Stream<Item = Chunk> + Send + 'static {
        self.bridge.observe(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::CancelAck;
    use crate::store::InMemoryStore;
    use async_trait::async_trait;
    use futures::StreamExt;
    use parking_lot::Mutex as SyncMutex;
    use relay_foundation::{EventBus, PersistenceConfig};
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingExecutor {
        started: SyncMutex<Vec<SubtaskId>>,
        cancelled: SyncMutex<Vec<SubtaskId>>,
    }

    #[async_trait]
    impl Executor for RecordingExecutor {
        async fn start(&self, subtask: &Subtask) -> Result<()> {
            self.started.lock().push(subtask.id);
            Ok(())
        }

        async fn cancel(&self, subtask: &Subtask) -> Result<CancelAck> {
            self.cancelled.lock().push(subtask.id);
            Ok(CancelAck::default())
        }

        fn name(&self) -> &'static str {
            "recording"
        }
    }

    fn manager(local: Arc<RecordingExecutor>) -> SubtaskManager {
        let bridge = Arc::new(PersistenceBridge::new(
            Arc::new(InMemoryStore::new()),
            Arc::new(EventBus::new()),
            &PersistenceConfig::default(),
        ));
        SubtaskManager::new(bridge).with_local_executor(local)
    }

    #[tokio::test]
    async fn test_begin_turn_creates_pair() {
        let manager = manager(Arc::new(RecordingExecutor::default()));
        let task = manager.create_task(7, Some("chat")).await.unwrap();
        assert_eq!(task.task_type(), Some("chat"));

        let turn = manager
            .begin_turn(task.id, "hello", ExecutionTarget::Local)
            .await
            .unwrap();
        assert_eq!(turn.user.status, Status::Completed);
        assert_eq!(turn.user.result.content.as_str(), "hello");
        assert_eq!(turn.assistant.status, Status::Pending);
        assert!(turn.assistant.message_id > turn.user.message_id);

        let task = manager.get_task(task.id).await.unwrap();
        assert_eq!(task.status, Status::Running);
    }

    #[tokio::test]
    async fn test_begin_turn_rejects_while_active() {
        let manager = manager(Arc::new(RecordingExecutor::default()));
        let task = manager.create_task(7, None).await.unwrap();
        manager
            .begin_turn(task.id, "first", ExecutionTarget::Local)
            .await
            .unwrap();

        let err = manager
            .begin_turn(task.id, "second", ExecutionTarget::Local)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_dispatch_routes_by_target() {
        let local = Arc::new(RecordingExecutor::default());
        let manager = manager(Arc::clone(&local));
        let task = manager.create_task(7, None).await.unwrap();

        let local_turn = manager
            .begin_turn(task.id, "hi", ExecutionTarget::Local)
            .await
            .unwrap();
        manager.dispatch(local_turn.assistant.id).await.unwrap();
        assert_eq!(*local.started.lock(), vec![local_turn.assistant.id]);

        manager.cancel(local_turn.assistant.id).await.unwrap();
        let remote_turn = manager
            .begin_turn(task.id, "again", ExecutionTarget::remote(""))
            .await
            .unwrap();
        let err = manager.dispatch(remote_turn.assistant.id).await.unwrap_err();
        assert!(matches!(err, Error::Executor(_)));
    }

    #[tokio::test]
    async fn test_retry_after_cancel_dispatches_again() {
        let local = Arc::new(RecordingExecutor::default());
        let manager = manager(Arc::clone(&local));
        let task = manager.create_task(7, None).await.unwrap();
        let turn = manager
            .begin_turn(task.id, "hi", ExecutionTarget::Local)
            .await
            .unwrap();
        let id = turn.assistant.id;

        manager.cancel(id).await.unwrap();
        assert!(manager.dispatch(id).await.is_err());

        let retried = manager.retry(id).await.unwrap();
        assert_eq!(retried.status, Status::Pending);
        assert_eq!(retried.progress, 0);
        assert_eq!(*local.started.lock(), vec![id]);
    }

    #[tokio::test]
    async fn test_cancel_goes_through_target_executor() {
        let local = Arc::new(RecordingExecutor::default());
        let manager = manager(Arc::clone(&local));
        let task = manager.create_task(7, None).await.unwrap();
        let turn = manager
            .begin_turn(task.id, "hi", ExecutionTarget::Local)
            .await
            .unwrap();

        let outcome = manager.cancel(turn.assistant.id).await.unwrap();
        assert!(matches!(outcome, CancelOutcome::Cancelled { .. }));
        assert_eq!(*local.cancelled.lock(), vec![turn.assistant.id]);
    }

    #[tokio::test]
    async fn test_remote_cancel_without_executor_still_finalizes() {
        let manager = manager(Arc::new(RecordingExecutor::default()));
        let task = manager.create_task(7, None).await.unwrap();
        let turn = manager
            .begin_turn(task.id, "hi", ExecutionTarget::remote("exec-1"))
            .await
            .unwrap();

        match manager.cancel(turn.assistant.id).await.unwrap() {
            CancelOutcome::Cancelled {
                subtask,
                remote_error,
                ..
            } => {
                assert_eq!(subtask.status, Status::Cancelled);
                assert!(remote_error.unwrap().contains("no remote executor"));
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_retry_of_older_turn_rejected_while_newer_turn_active() {
        let manager = manager(Arc::new(RecordingExecutor::default()));
        let task = manager.create_task(7, None).await.unwrap();

        let first = manager
            .begin_turn(task.id, "first", ExecutionTarget::Local)
            .await
            .unwrap();
        manager.cancel(first.assistant.id).await.unwrap();
        let second = manager
            .begin_turn(task.id, "second", ExecutionTarget::Local)
            .await
            .unwrap();

        let err = manager.retry(first.assistant.id).await.unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));

        let active: Vec<SubtaskId> = manager
            .list_subtasks(task.id)
            .await
            .unwrap()
            .into_iter()
            .filter(|s| !s.deleted && !s.is_terminal())
            .map(|s| s.id)
            .collect();
        assert_eq!(active, vec![second.assistant.id]);
        assert_eq!(
            manager.get_subtask(first.assistant.id).await.unwrap().status,
            Status::Cancelled
        );
    }

    #[tokio::test]
    async fn test_retry_of_superseded_turn_rejected() {
        let manager = manager(Arc::new(RecordingExecutor::default()));
        let task = manager.create_task(7, None).await.unwrap();

        let first = manager
            .begin_turn(task.id, "first", ExecutionTarget::Local)
            .await
            .unwrap();
        manager.cancel(first.assistant.id).await.unwrap();
        let second = manager
            .begin_turn(task.id, "second", ExecutionTarget::Local)
            .await
            .unwrap();
        manager.cancel(second.assistant.id).await.unwrap();

        // Nothing is active, but the first turn is no longer the latest
        let err = manager.retry(first.assistant.id).await.unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
        assert_eq!(
            manager.retry(second.assistant.id).await.unwrap().status,
            Status::Pending
        );
    }

    #[tokio::test]
    async fn test_observe_cancelled_subtask_ends() {
        let manager = manager(Arc::new(RecordingExecutor::default()));
        let task = manager.create_task(7, None).await.unwrap();
        let turn = manager
            .begin_turn(task.id, "hi", ExecutionTarget::Local)
            .await
            .unwrap();
        manager.cancel(turn.assistant.id).await.unwrap();

        let mut stream = Box::pin(manager.observe(turn.assistant.id));
        let first = tokio::time::timeout(Duration::from_millis(500), stream.next())
            .await
            .expect("observe of a finished subtask hung")
            .unwrap();
        assert!(first.is_terminal_status());
        assert!(stream.next().await.is_none());
        assert_eq!(manager.bridge().subscriber_count(turn.assistant.id), 0);
    }
}
