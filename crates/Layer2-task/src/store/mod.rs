//! Durable store interface
//!
//! The store is synchronous; async callers go through
//! [`BlockingPool`](crate::pool::BlockingPool). Updates are compare-and-swap
//! on `version`: a stale writer gets [`Error::Conflict`] and must re-read.
//!
//! - `memory.rs` - `InMemoryStore` (tests, embedding)
//! - `sqlite.rs` - `SqliteStore` (CLI host)
//!
//! [`Error::Conflict`]: relay_foundation::Error::Conflict

mod memory;
mod sqlite;

pub use memory::InMemoryStore;
pub use sqlite::SqliteStore;

use crate::state::Status;
use crate::task::{ExecutorHandle, Subtask, SubtaskId, Task, TaskId};
use chrono::{DateTime, Utc};
use relay_foundation::Result;

/// Selection for the reaper's scan
#[derive(Debug, Clone)]
pub struct ReclaimFilter {
    /// Subtask statuses eligible for reclaim
    pub statuses: Vec<Status>,

    /// Both subtask and task must be untouched since before this instant
    pub updated_before: DateTime<Utc>,
}

impl ReclaimFilter {
    pub fn terminal_before(updated_before: DateTime<Utc>) -> Self {
        Self {
            statuses: Status::TERMINAL.to_vec(),
            updated_before,
        }
    }
}

/// A subtask whose remote executor may be reclaimable
#[derive(Debug, Clone, PartialEq)]
pub struct ReclaimCandidate {
    pub subtask_id: SubtaskId,
    pub task_id: TaskId,
    pub executor: ExecutorHandle,
    pub subtask_updated_at: DateTime<Utc>,
    pub task_updated_at: DateTime<Utc>,
    pub task_type: Option<String>,
}

impl ReclaimCandidate {
    /// Most recent of the two timestamps the retention window is measured from
    pub fn last_touched(&self) -> DateTime<Utc> {
        self.subtask_updated_at.max(self.task_updated_at)
    }
}

pub trait TaskStore: Send + Sync {
    /// Insert a task; the store assigns `id` and sets `version` to 1
    fn insert_task(&self, task: Task) -> Result<Task>;

    fn get_task(&self, id: TaskId) -> Result<Option<Task>>;

    /// Compare-and-swap on `task.version`; returns the stored row
    fn update_task(&self, task: &Task) -> Result<Task>;

    /// Insert a subtask; the store assigns `id` and sets `version` to 1
    fn insert_subtask(&self, subtask: Subtask) -> Result<Subtask>;

    fn get_subtask(&self, id: SubtaskId) -> Result<Option<Subtask>>;

    /// Compare-and-swap on `subtask.version`; returns the stored row
    fn update_subtask(&self, subtask: &Subtask) -> Result<Subtask>;

    /// Subtasks of a task ordered by `(message_id, id)`
    fn list_subtasks(&self, task_id: TaskId) -> Result<Vec<Subtask>>;

    /// Terminal subtasks of terminal tasks with an unreclaimed executor
    fn scan_reclaimable(&self, filter: &ReclaimFilter) -> Result<Vec<ReclaimCandidate>>;

    /// Stamp `executor_deleted_at` on every subtask referencing `executor`;
    /// returns the number of rows marked
    fn mark_executor_reclaimed(&self, executor: &ExecutorHandle, at: DateTime<Utc>)
        -> Result<usize>;
}
