//! Persistence bridge
//!
//! Every chunk goes through here: it is applied to the stored subtask under a
//! per-subtask FIFO lock, written with optimistic versioning, and only then
//! fanned out to live subscribers. Task status is re-derived after each
//! subtask status change.

use crate::chunk::{AppendOutcome, Chunk, ChunkPayload};
use crate::pool::BlockingPool;
use crate::state::Status;
use crate::store::TaskStore;
use crate::task::{ExecutionTarget, ExecutorHandle, Subtask, SubtaskId, Task, TaskId};
use chrono::{DateTime, Utc};
use futures::Stream;
use parking_lot::Mutex;
use relay_foundation::event::{chunk as chunk_events, subtask as subtask_events};
use relay_foundation::{Error, EventBus, PersistenceConfig, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex as AsyncMutex};
use tracing::{debug, info, warn};

/// Error text recorded when a producer fails without one
pub const DEFAULT_FAILURE_MESSAGE: &str = "Subtask failed without an error message";

/// What applying a chunk did to the stored subtask
#[derive(Debug, Clone)]
pub enum ApplyOutcome {
    /// Row written; carries the stored subtask
    Applied(Subtask),
    /// Nothing new (repeat or buffered-only no-op)
    Unchanged(Subtask),
    /// Subtask already terminal; chunk accepted but not applied
    IgnoredTerminal(Subtask),
}

impl ApplyOutcome {
    pub fn subtask(&self) -> &Subtask {
        match self {
            ApplyOutcome::Applied(s) | ApplyOutcome::Unchanged(s) | ApplyOutcome::IgnoredTerminal(s) => s,
        }
    }

    pub fn is_applied(&self) -> bool {
        matches!(self, ApplyOutcome::Applied(_))
    }
}

/// Result of a read-modify-write
enum Modified {
    Written { before: Subtask, after: Subtask },
    Unchanged(Subtask),
}

/// Apply one chunk to a subtask row in memory.
///
/// Returns `Ok(true)` when the row changed. Terminal rows are never touched.
pub fn apply_chunk_to(subtask: &mut Subtask, chunk: &Chunk, now: DateTime<Utc>) -> Result<bool> {
    if subtask.is_terminal() {
        return Ok(false);
    }
    if chunk.task_id != subtask.task_id {
        return Err(Error::InvalidInput(format!(
            "chunk for task {} sent to subtask {} of task {}",
            chunk.task_id, subtask.id, subtask.task_id
        )));
    }

    let mut changed = match &chunk.payload {
        ChunkPayload::Content { content, offset } => {
            let outcome = subtask.result.content.apply(*offset, content);
            outcome != AppendOutcome::Duplicate
        }
        ChunkPayload::Reasoning { content, offset } => {
            let outcome = subtask.result.reasoning.apply(*offset, content);
            outcome != AppendOutcome::Duplicate
        }
        ChunkPayload::ThinkingStep { step_index, step } => {
            if subtask.result.thinking.get(*step_index) == Some(step) {
                false
            } else {
                subtask.result.thinking.upsert(*step_index, step.clone());
                true
            }
        }
        ChunkPayload::WorkbenchDelta(delta) => {
            let before = subtask.result.workbench.clone();
            subtask.result.workbench.merge(delta);
            before != subtask.result.workbench
        }
        ChunkPayload::Status {
            status,
            progress,
            error_message,
        } => apply_status(subtask, *status, *progress, error_message.as_deref(), now)?,
    };

    // First data from the producer means the subtask is running
    if subtask.status == Status::Pending && changed {
        subtask.transition(Status::Running, now)?;
    }

    if let Some(handle) = &chunk.executor {
        changed |= bind_executor_to(subtask, handle);
    }

    if changed {
        subtask.updated_at = now;
    }
    Ok(changed)
}

fn apply_status(
    subtask: &mut Subtask,
    status: Status,
    progress: u8,
    error_message: Option<&str>,
    now: DateTime<Utc>,
) -> Result<bool> {
    let before = (subtask.status, subtask.progress, subtask.error_message.clone());
    match status {
        Status::Pending => {
            debug!(subtask_id = %subtask.id, "Ignoring PENDING status chunk");
            return Ok(false);
        }
        Status::Running => {
            subtask.transition(Status::Running, now)?;
            subtask.progress = subtask.progress.max(progress.min(100));
        }
        Status::Completed => {
            subtask.transition(Status::Completed, now)?;
            subtask.progress = 100;
            subtask.error_message = None;
        }
        Status::Failed => {
            subtask.transition(Status::Failed, now)?;
            subtask.progress = subtask.progress.max(progress.min(100));
            let message = error_message
                .map(str::trim)
                .filter(|m| !m.is_empty())
                .unwrap_or(DEFAULT_FAILURE_MESSAGE);
            subtask.error_message = Some(message.to_string());
        }
        Status::Cancelled => {
            subtask.transition(Status::Cancelled, now)?;
            subtask.progress = 100;
            subtask.error_message = None;
        }
    }
    Ok(before != (subtask.status, subtask.progress, subtask.error_message.clone()))
}

/// Fill in the executor name of a remote target once the agent reports it
fn bind_executor_to(subtask: &mut Subtask, handle: &ExecutorHandle) -> bool {
    match &mut subtask.target {
        ExecutionTarget::Remote {
            executor_name,
            executor_namespace,
        } if executor_name.is_empty() => {
            *executor_name = handle.name.clone();
            *executor_namespace = handle.namespace.clone();
            true
        }
        ExecutionTarget::Remote { .. } => false,
        ExecutionTarget::Local => {
            debug!(subtask_id = %subtask.id, executor = %handle, "Executor reported for local subtask");
            false
        }
    }
}

/// Status chunk restating a terminal subtask's final state
fn final_status_chunk(subtask: &Subtask) -> Chunk {
    Chunk::new(
        subtask.task_id,
        subtask.id,
        ChunkPayload::Status {
            status: subtask.status,
            progress: subtask.progress,
            error_message: subtask.error_message.clone(),
        },
    )
}

/// Drop the channel of `id` once nobody listens on it
fn prune_subscribers(
    subscribers: &Mutex<HashMap<SubtaskId, broadcast::Sender<Chunk>>>,
    id: SubtaskId,
) {
    let mut subscribers = subscribers.lock();
    if subscribers.get(&id).map(|tx| tx.receiver_count()) == Some(0) {
        subscribers.remove(&id);
    }
}

/// Serializes all writes for a subtask and fans persisted chunks out
pub struct PersistenceBridge {
    store: Arc<dyn TaskStore>,
    pool: BlockingPool,
    events: Arc<EventBus>,
    locks: Mutex<HashMap<SubtaskId, Arc<AsyncMutex<()>>>>,
    subscribers: Arc<Mutex<HashMap<SubtaskId, broadcast::Sender<Chunk>>>>,
    max_write_retries: usize,
    subscriber_capacity: usize,
}

impl PersistenceBridge {
    pub fn new(store: Arc<dyn TaskStore>, events: Arc<EventBus>, config: &PersistenceConfig) -> Self {
        Self {
            store,
            pool: BlockingPool::new(config.worker_threads),
            events,
            locks: Mutex::new(HashMap::new()),
            subscribers: Arc::new(Mutex::new(HashMap::new())),
            max_write_retries: config.max_write_retries,
            subscriber_capacity: config.subscriber_capacity.max(1),
        }
    }

    pub fn store(&self) -> Arc<dyn TaskStore> {
        Arc::clone(&self.store)
    }

    pub fn pool(&self) -> &BlockingPool {
        &self.pool
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    // ========================================================================
    // Reads
    // ========================================================================

    pub async fn get_subtask(&self, id: SubtaskId) -> Result<Subtask> {
        let store = self.store();
        self.pool
            .run(move || store.get_subtask(id))
            .await?
            .ok_or_else(|| Error::NotFound(format!("subtask {}", id)))
    }

    pub async fn get_task(&self, id: TaskId) -> Result<Task> {
        let store = self.store();
        self.pool
            .run(move || store.get_task(id))
            .await?
            .ok_or_else(|| Error::NotFound(format!("task {}", id)))
    }

    pub async fn list_subtasks(&self, task_id: TaskId) -> Result<Vec<Subtask>> {
        let store = self.store();
        self.pool.run(move || store.list_subtasks(task_id)).await
    }

    // ========================================================================
    // Per-subtask serialization
    // ========================================================================

    fn lock_for(&self, id: SubtaskId) -> Arc<AsyncMutex<()>> {
        Arc::clone(self.locks.lock().entry(id).or_default())
    }

    fn release_lock(&self, id: SubtaskId, lock: &Arc<AsyncMutex<()>>) {
        let mut locks = self.locks.lock();
        // Map entry plus ours: nobody else is queued
        if Arc::strong_count(lock) == 2 {
            locks.remove(&id);
        }
    }

    /// Read-modify-write with conflict retry, run on the blocking pool
    async fn modify_subtask<F>(&self, id: SubtaskId, f: F) -> Result<Modified>
    where
        F: FnMut(&mut Subtask) -> Result<bool> + Send + 'static,
    {
        let store = self.store();
        let retries = self.max_write_retries;
        self.pool
            .run(move || {
                let mut f = f;
                let mut attempt = 0;
                loop {
                    let mut subtask = store
                        .get_subtask(id)?
                        .ok_or_else(|| Error::NotFound(format!("subtask {}", id)))?;
                    let before = subtask.clone();
                    if !f(&mut subtask)? {
                        return Ok(Modified::Unchanged(before));
                    }
                    match store.update_subtask(&subtask) {
                        Ok(after) => return Ok(Modified::Written { before, after }),
                        Err(Error::Conflict(reason)) if attempt < retries => {
                            attempt += 1;
                            debug!(subtask_id = %id, attempt, %reason, "Write conflict, retrying");
                        }
                        Err(e) => return Err(e),
                    }
                }
            })
            .await
    }

    /// Re-derive task status (and record `task_type`) with conflict retry.
    ///
    /// Returns the stored task and whether its status changed.
    pub async fn refresh_task_status(
        &self,
        task_id: TaskId,
        task_type: Option<String>,
    ) -> Result<(Task, bool)> {
        let store = self.store();
        let retries = self.max_write_retries;
        let (task, status_changed) = self
            .pool
            .run(move || {
                let mut attempt = 0;
                loop {
                    let mut task = store
                        .get_task(task_id)?
                        .ok_or_else(|| Error::NotFound(format!("task {}", task_id)))?;
                    let subtasks = store.list_subtasks(task_id)?;
                    let previous = task.status;

                    let mut changed = task.derive_status(&subtasks, Utc::now());
                    if let Some(task_type) = &task_type {
                        if task.task_type() != Some(task_type.as_str()) {
                            task.set_task_type(task_type.clone());
                            changed = true;
                        }
                    }
                    if !changed {
                        return Ok((task, false));
                    }

                    match store.update_task(&task) {
                        Ok(stored) => {
                            let status_changed = stored.status != previous;
                            return Ok((stored, status_changed));
                        }
                        Err(Error::Conflict(reason)) if attempt < retries => {
                            attempt += 1;
                            debug!(task_id = %task_id, attempt, %reason, "Task write conflict, retrying");
                        }
                        Err(e) => return Err(e),
                    }
                }
            })
            .await?;

        if status_changed {
            info!(task_id = %task.id, status = %task.status, "Task status changed");
            self.events
                .publish(subtask_events::task_status_changed(
                    task.id.0,
                    task.status.as_str(),
                ))
                .await;
        }
        Ok((task, status_changed))
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// Persist one chunk, then fan it out to subscribers
    pub async fn apply_chunk(&self, chunk: Chunk) -> Result<ApplyOutcome> {
        let id = chunk.subtask_id;
        let lock = self.lock_for(id);
        let result = {
            let _guard = lock.lock().await;
            self.apply_chunk_locked(chunk).await
        };
        self.release_lock(id, &lock);
        result
    }

    async fn apply_chunk_locked(&self, chunk: Chunk) -> Result<ApplyOutcome> {
        let id = chunk.subtask_id;
        let to_apply = chunk.clone();
        let modified = self
            .modify_subtask(id, move |subtask| {
                apply_chunk_to(subtask, &to_apply, Utc::now())
            })
            .await?;

        let (before, after) = match modified {
            Modified::Unchanged(current) if current.is_terminal() => {
                info!(
                    subtask_id = %id,
                    status = %current.status,
                    chunk_type = %chunk.chunk_type(),
                    "Late chunk for terminal subtask ignored"
                );
                return Ok(ApplyOutcome::IgnoredTerminal(current));
            }
            Modified::Unchanged(current) => {
                debug!(subtask_id = %id, chunk_type = %chunk.chunk_type(), "Chunk already applied");
                if chunk.task_type.is_some() {
                    self.refresh_task_status(current.task_id, chunk.task_type.clone())
                        .await?;
                }
                return Ok(ApplyOutcome::Unchanged(current));
            }
            Modified::Written { before, after } => (before, after),
        };

        self.events
            .publish(chunk_events::persisted(
                after.task_id.0,
                id.0,
                chunk.chunk_type().as_str(),
            ))
            .await;

        if before.status != after.status {
            self.on_status_changed(&after).await;
        }
        if before.status != after.status || chunk.task_type.is_some() {
            self.refresh_task_status(after.task_id, chunk.task_type.clone())
                .await?;
        }

        self.fan_out(chunk, after.is_terminal());
        Ok(ApplyOutcome::Applied(after))
    }

    async fn on_status_changed(&self, subtask: &Subtask) {
        info!(
            subtask_id = %subtask.id,
            task_id = %subtask.task_id,
            status = %subtask.status,
            progress = subtask.progress,
            "Subtask status changed"
        );
        self.events
            .publish(subtask_events::status_changed(
                subtask.task_id.0,
                subtask.id.0,
                subtask.status.as_str(),
                subtask.progress,
            ))
            .await;
    }

    /// RUNNING checkpoint of the content assembled so far; never completes
    pub async fn save_partial(&self, id: SubtaskId, content: String) -> Result<ApplyOutcome> {
        let lock = self.lock_for(id);
        let result = {
            let _guard = lock.lock().await;
            let modified = self
                .modify_subtask(id, move |subtask| {
                    if subtask.is_terminal() {
                        return Ok(false);
                    }
                    let now = Utc::now();
                    let appended =
                        subtask.result.content.apply(0, &content) == AppendOutcome::Appended;
                    let started = subtask.status == Status::Pending;
                    if started {
                        subtask.transition(Status::Running, now)?;
                    }
                    if appended || started {
                        subtask.updated_at = now;
                    }
                    Ok(appended || started)
                })
                .await;
            match modified {
                Ok(Modified::Written { before, after }) => {
                    if before.status != after.status {
                        self.on_status_changed(&after).await;
                        self.refresh_task_status(after.task_id, None).await?;
                    }
                    Ok(ApplyOutcome::Applied(after))
                }
                Ok(Modified::Unchanged(s)) if s.is_terminal() => Ok(ApplyOutcome::IgnoredTerminal(s)),
                Ok(Modified::Unchanged(s)) => Ok(ApplyOutcome::Unchanged(s)),
                Err(e) => Err(e),
            }
        };
        self.release_lock(id, &lock);
        result
    }

    /// Terminal cancel update: CANCELLED, progress 100, partial result kept.
    ///
    /// Returns `Unchanged` without writing when the subtask is already
    /// terminal.
    pub async fn finalize_cancel(&self, id: SubtaskId) -> Result<ApplyOutcome> {
        let lock = self.lock_for(id);
        let result = {
            let _guard = lock.lock().await;
            self.finalize_cancel_locked(id).await
        };
        self.release_lock(id, &lock);
        result
    }

    async fn finalize_cancel_locked(&self, id: SubtaskId) -> Result<ApplyOutcome> {
        let modified = self
            .modify_subtask(id, |subtask| {
                if subtask.is_terminal() {
                    return Ok(false);
                }
                subtask.transition(Status::Cancelled, Utc::now())?;
                subtask.progress = 100;
                subtask.error_message = None;
                Ok(true)
            })
            .await?;

        match modified {
            Modified::Unchanged(current) => Ok(ApplyOutcome::IgnoredTerminal(current)),
            Modified::Written { after, .. } => {
                self.on_status_changed(&after).await;
                self.refresh_task_status(after.task_id, None).await?;

                let chunk = Chunk::new(
                    after.task_id,
                    after.id,
                    ChunkPayload::status(Status::Cancelled, 100),
                );
                self.fan_out(chunk, true);
                Ok(ApplyOutcome::Applied(after))
            }
        }
    }

    /// Explicit retry: FAILED/CANCELLED back to PENDING with a clean result
    pub async fn reset_for_retry(&self, id: SubtaskId) -> Result<Subtask> {
        let lock = self.lock_for(id);
        let result = {
            let _guard = lock.lock().await;
            let modified = self
                .modify_subtask(id, |subtask| {
                    subtask.reset_for_retry(Utc::now())?;
                    Ok(true)
                })
                .await;
            match modified {
                Ok(Modified::Written { after, .. }) => {
                    self.on_status_changed(&after).await;
                    self.refresh_task_status(after.task_id, None).await?;
                    Ok(after)
                }
                Ok(Modified::Unchanged(s)) => Ok(s),
                Err(e) => Err(e),
            }
        };
        self.release_lock(id, &lock);
        result
    }

    /// Record the remote agent that picked up a subtask
    pub async fn bind_executor(&self, id: SubtaskId, handle: ExecutorHandle) -> Result<Subtask> {
        let lock = self.lock_for(id);
        let result = {
            let _guard = lock.lock().await;
            self.modify_subtask(id, move |subtask| {
                if subtask.is_terminal() {
                    return Ok(false);
                }
                let bound = bind_executor_to(subtask, &handle);
                if bound {
                    subtask.updated_at = Utc::now();
                }
                Ok(bound)
            })
            .await
        };
        self.release_lock(id, &lock);
        match result? {
            Modified::Written { after, .. } => Ok(after),
            Modified::Unchanged(s) => Ok(s),
        }
    }

    // ========================================================================
    // Live subscribers
    // ========================================================================

    fn register(&self, id: SubtaskId) -> broadcast::Receiver<Chunk> {
        self.subscribers
            .lock()
            .entry(id)
            .or_insert_with(|| broadcast::channel(self.subscriber_capacity).0)
            .subscribe()
    }

    /// Receive every chunk persisted for `id` from now on.
    ///
    /// `None` when the subtask is already terminal, since nothing more will
    /// be persisted for it.
    pub async fn subscribe(&self, id: SubtaskId) -> Result<Option<broadcast::Receiver<Chunk>>> {
        let rx = self.register(id);
        let current = self.get_subtask(id).await;
        match current {
            Ok(subtask) if !subtask.is_terminal() => Ok(Some(rx)),
            other => {
                drop(rx);
                prune_subscribers(&self.subscribers, id);
                other.map(|_| None)
            }
        }
    }

    /// Stream of persisted chunks that ends after the terminal status chunk.
    ///
    /// A subtask that is already terminal yields its final status once.
    pub fn observe(&self, id: SubtaskId) -> impl Stream<Item = Chunk> + Send + 'static {
        // Registered now so chunks persisted before the first poll are kept
        let mut rx = self.register(id);
        let store = self.store();
        let pool = self.pool.clone();
        let subscribers = Arc::clone(&self.subscribers);

        async_stream::stream! {
            let live = match pool.run(move || store.get_subtask(id)).await {
                Ok(Some(subtask)) if subtask.is_terminal() => {
                    let mut done = false;
                    loop {
                        match rx.try_recv() {
                            Ok(chunk) => {
                                done = chunk.is_terminal_status();
                                yield chunk;
                                if done {
                                    break;
                                }
                            }
                            Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                            Err(_) => break,
                        }
                    }
                    if !done {
                        yield final_status_chunk(&subtask);
                    }
                    false
                }
                Ok(Some(_)) => true,
                Ok(None) => {
                    warn!(subtask_id = %id, "Observed subtask does not exist");
                    false
                }
                Err(e) => {
                    warn!(subtask_id = %id, error = %e, "Observed subtask could not be read");
                    false
                }
            };

            if live {
                loop {
                    match rx.recv().await {
                        Ok(chunk) => {
                            let done = chunk.is_terminal_status();
                            yield chunk;
                            if done {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(subtask_id = %id, skipped, "Subscriber lagged; chunks dropped");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
            drop(rx);
            prune_subscribers(&subscribers, id);
        }
    }

    pub fn subscriber_count(&self, id: SubtaskId) -> usize {
        self.subscribers
            .lock()
            .get(&id)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }

    /// Best-effort delivery; a terminal chunk closes the channel
    fn fan_out(&self, chunk: Chunk, terminal: bool) {
        let id = chunk.subtask_id;
        let mut subscribers = self.subscribers.lock();
        // A send error only means every receiver is gone
        let abandoned = subscribers
            .get(&id)
            .map(|tx| tx.send(chunk).is_err())
            .unwrap_or(false);
        if terminal || abandoned {
            subscribers.remove(&id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{StepStatus, ThinkingStep, WorkbenchDelta};
    use crate::store::InMemoryStore;
    use crate::task::SubtaskRole;
    use futures::StreamExt;

    async fn setup() -> (PersistenceBridge, Subtask) {
        let store = Arc::new(InMemoryStore::new());
        let task = store.insert_task(Task::new(1)).unwrap();
        let subtask = store
            .insert_subtask(Subtask::new(task.id, SubtaskRole::Assistant, 1))
            .unwrap();
        let bridge = PersistenceBridge::new(
            store,
            Arc::new(EventBus::new()),
            &PersistenceConfig::default(),
        );
        (bridge, subtask)
    }

    fn content(s: &Subtask, offset: usize, text: &str) -> Chunk {
        Chunk::new(
            s.task_id,
            s.id,
            ChunkPayload::Content {
                content: text.into(),
                offset,
            },
        )
    }

    #[tokio::test]
    async fn test_first_data_moves_pending_to_running() {
        let (bridge, s) = setup().await;
        let outcome = bridge.apply_chunk(content(&s, 0, "Hi")).await.unwrap();
        assert_eq!(outcome.subtask().status, Status::Running);

        let task = bridge.get_task(s.task_id).await.unwrap();
        assert_eq!(task.status, Status::Running);
    }

    #[tokio::test]
    async fn test_completion_stamps_and_propagates() {
        let (bridge, s) = setup().await;
        bridge.apply_chunk(content(&s, 0, "He")).await.unwrap();
        bridge.apply_chunk(content(&s, 2, "llo")).await.unwrap();
        bridge
            .apply_chunk(Chunk::new(
                s.task_id,
                s.id,
                ChunkPayload::status(Status::Completed, 100),
            ))
            .await
            .unwrap();

        let stored = bridge.get_subtask(s.id).await.unwrap();
        assert_eq!(stored.result.value(), "Hello");
        assert_eq!(stored.progress, 100);
        assert!(stored.completed_at.is_some());
        assert_eq!(bridge.get_task(s.task_id).await.unwrap().status, Status::Completed);
    }

    #[tokio::test]
    async fn test_terminal_rows_ignore_late_chunks() {
        let (bridge, s) = setup().await;
        bridge
            .apply_chunk(Chunk::new(s.task_id, s.id, ChunkPayload::failed("boom")))
            .await
            .unwrap();

        let late = bridge.apply_chunk(content(&s, 0, "late")).await.unwrap();
        assert!(matches!(late, ApplyOutcome::IgnoredTerminal(_)));

        let stored = bridge.get_subtask(s.id).await.unwrap();
        assert_eq!(stored.status, Status::Failed);
        assert_eq!(stored.result.value(), "");
    }

    #[tokio::test]
    async fn test_failure_always_has_message() {
        let (bridge, s) = setup().await;
        bridge
            .apply_chunk(Chunk::new(
                s.task_id,
                s.id,
                ChunkPayload::Status {
                    status: Status::Failed,
                    progress: 40,
                    error_message: Some("   ".into()),
                },
            ))
            .await
            .unwrap();

        let stored = bridge.get_subtask(s.id).await.unwrap();
        assert_eq!(stored.error_message.as_deref(), Some(DEFAULT_FAILURE_MESSAGE));
        let task = bridge.get_task(s.task_id).await.unwrap();
        assert_eq!(task.error_message.as_deref(), Some(DEFAULT_FAILURE_MESSAGE));
    }

    #[tokio::test]
    async fn test_progress_is_monotonic() {
        let (bridge, s) = setup().await;
        for progress in [30, 10, 50] {
            bridge
                .apply_chunk(Chunk::new(
                    s.task_id,
                    s.id,
                    ChunkPayload::status(Status::Running, progress),
                ))
                .await
                .unwrap();
        }
        assert_eq!(bridge.get_subtask(s.id).await.unwrap().progress, 50);
    }

    #[tokio::test]
    async fn test_partial_checkpoint_does_not_complete() {
        let (bridge, s) = setup().await;
        bridge.save_partial(s.id, "Hel".into()).await.unwrap();
        bridge.save_partial(s.id, "Hello".into()).await.unwrap();

        let stored = bridge.get_subtask(s.id).await.unwrap();
        assert_eq!(stored.status, Status::Running);
        assert_eq!(stored.result.value(), "Hello");
        assert!(stored.completed_at.is_none());
    }

    #[tokio::test]
    async fn test_step_and_workbench_chunks() {
        let (bridge, s) = setup().await;
        bridge
            .apply_chunk(Chunk::new(
                s.task_id,
                s.id,
                ChunkPayload::ThinkingStep {
                    step_index: 0,
                    step: ThinkingStep::new("search", StepStatus::Running),
                },
            ))
            .await
            .unwrap();
        bridge
            .apply_chunk(Chunk::new(
                s.task_id,
                s.id,
                ChunkPayload::ThinkingStep {
                    step_index: 0,
                    step: ThinkingStep::new("search", StepStatus::Completed),
                },
            ))
            .await
            .unwrap();
        bridge
            .apply_chunk(Chunk::new(
                s.task_id,
                s.id,
                ChunkPayload::WorkbenchDelta(WorkbenchDelta {
                    summary: Some("edited".into()),
                    ..Default::default()
                }),
            ))
            .await
            .unwrap();

        let stored = bridge.get_subtask(s.id).await.unwrap();
        assert_eq!(stored.result.thinking.len(), 1);
        assert_eq!(
            stored.result.thinking.get(0).unwrap().status,
            StepStatus::Completed
        );
        assert_eq!(stored.result.workbench.summary.as_deref(), Some("edited"));
    }

    #[tokio::test]
    async fn test_task_type_recorded_on_task() {
        let (bridge, s) = setup().await;
        bridge
            .apply_chunk(content(&s, 0, "x").with_task_type("code"))
            .await
            .unwrap();
        let task = bridge.get_task(s.task_id).await.unwrap();
        assert_eq!(task.task_type(), Some("code"));
    }

    #[tokio::test]
    async fn test_concurrent_chunks_are_all_applied() {
        let (bridge, s) = setup().await;
        let bridge = Arc::new(bridge);
        let text = "abcdefghijklmnopqrstuvwxyz";

        let mut handles = Vec::new();
        for (i, ch) in text.chars().enumerate() {
            let bridge = Arc::clone(&bridge);
            let chunk = content(&s, i, &ch.to_string());
            handles.push(tokio::spawn(async move { bridge.apply_chunk(chunk).await }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(bridge.get_subtask(s.id).await.unwrap().result.value(), text);
        assert!(bridge.locks.lock().is_empty());
    }

    #[tokio::test]
    async fn test_observe_ends_after_terminal_chunk() {
        let (bridge, s) = setup().await;
        let bridge = Arc::new(bridge);
        let stream = bridge.observe(s.id);

        bridge.apply_chunk(content(&s, 0, "Hi")).await.unwrap();
        bridge
            .apply_chunk(Chunk::new(
                s.task_id,
                s.id,
                ChunkPayload::status(Status::Completed, 100),
            ))
            .await
            .unwrap();

        let seen: Vec<Chunk> = stream.collect().await;
        assert_eq!(seen.len(), 2);
        assert!(seen[1].is_terminal_status());
        assert_eq!(bridge.subscriber_count(s.id), 0);
    }

    #[tokio::test]
    async fn test_chunk_for_wrong_task_is_rejected() {
        let (bridge, s) = setup().await;
        let stray = Chunk::new(
            TaskId(s.task_id.0 + 100),
            s.id,
            ChunkPayload::Content {
                content: "x".into(),
                offset: 0,
            },
        );
        assert!(matches!(
            bridge.apply_chunk(stray).await,
            Err(Error::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn test_observe_terminal_subtask_yields_final_status() {
        let (bridge, s) = setup().await;
        bridge.apply_chunk(content(&s, 0, "partial")).await.unwrap();
        bridge
            .apply_chunk(Chunk::new(s.task_id, s.id, ChunkPayload::failed("boom")))
            .await
            .unwrap();

        let seen: Vec<Chunk> = tokio::time::timeout(
            std::time::Duration::from_millis(500),
            bridge.observe(s.id).collect(),
        )
        .await
        .expect("observe of a terminal subtask hung");

        assert_eq!(seen.len(), 1);
        match &seen[0].payload {
            ChunkPayload::Status {
                status,
                progress,
                error_message,
            } => {
                assert_eq!(*status, Status::Failed);
                assert_eq!(*progress, 100);
                assert_eq!(error_message.as_deref(), Some("boom"));
            }
            other => panic!("unexpected payload {:?}", other),
        }
        assert!(bridge.subscribers.lock().is_empty());
    }

    #[tokio::test]
    async fn test_subscribe_to_terminal_subtask_registers_nothing() {
        let (bridge, s) = setup().await;
        assert!(bridge.subscribe(s.id).await.unwrap().is_some());

        bridge
            .apply_chunk(Chunk::new(
                s.task_id,
                s.id,
                ChunkPayload::status(Status::Completed, 100),
            ))
            .await
            .unwrap();

        assert!(bridge.subscribe(s.id).await.unwrap().is_none());
        assert!(bridge.subscribers.lock().is_empty());
        assert!(matches!(
            bridge.subscribe(SubtaskId(999)).await,
            Err(Error::NotFound(_))
        ));
        assert!(bridge.subscribers.lock().is_empty());
    }

    #[tokio::test]
    async fn test_dropped_observer_channel_is_pruned() {
        let (bridge, s) = setup().await;
        drop(bridge.observe(s.id));
        assert_eq!(bridge.subscribers.lock().len(), 1);

        bridge.apply_chunk(content(&s, 0, "x")).await.unwrap();
        assert!(bridge.subscribers.lock().is_empty());
    }
}
