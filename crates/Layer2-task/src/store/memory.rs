//! In-memory store

use super::{ReclaimCandidate, ReclaimFilter, TaskStore};
use crate::task::{ExecutorHandle, Subtask, SubtaskId, Task, TaskId};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use relay_foundation::{Error, Result};
use std::collections::BTreeMap;

#[derive(Default)]
struct Tables {
    tasks: BTreeMap<TaskId, Task>,
    subtasks: BTreeMap<SubtaskId, Subtask>,
    next_task_id: i64,
    next_subtask_id: i64,
}

/// Store backed by ordered maps behind one mutex
#[derive(Default)]
pub struct InMemoryStore {
    tables: Mutex<Tables>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TaskStore for InMemoryStore {
    fn insert_task(&self, mut task: Task) -> Result<Task> {
        let mut tables = self.tables.lock();
        tables.next_task_id += 1;
        task.id = TaskId(tables.next_task_id);
        task.version = 1;
        tables.tasks.insert(task.id, task.clone());
        Ok(task)
    }

    fn get_task(&self, id: TaskId) -> Result<Option<Task>> {
        Ok(self.tables.lock().tasks.get(&id).cloned())
    }

    fn update_task(&self, task: &Task) -> Result<Task> {
        let mut tables = self.tables.lock();
        let stored = tables
            .tasks
            .get_mut(&task.id)
            .ok_or_else(|| Error::NotFound(format!("task {}", task.id)))?;
        if stored.version != task.version {
            return Err(Error::Conflict(format!(
                "task {} at version {}, write based on {}",
                task.id, stored.version, task.version
            )));
        }
        *stored = task.clone();
        stored.version += 1;
        Ok(stored.clone())
    }

    fn insert_subtask(&self, mut subtask: Subtask) -> Result<Subtask> {
        let mut tables = self.tables.lock();
        if !tables.tasks.contains_key(&subtask.task_id) {
            return Err(Error::NotFound(format!("task {}", subtask.task_id)));
        }
        tables.next_subtask_id += 1;
        subtask.id = SubtaskId(tables.next_subtask_id);
        subtask.version = 1;
        tables.subtasks.insert(subtask.id, subtask.clone());
        Ok(subtask)
    }

    fn get_subtask(&self, id: SubtaskId) -> Result<Option<Subtask>> {
        Ok(self.tables.lock().subtasks.get(&id).cloned())
    }

    fn update_subtask(&self, subtask: &Subtask) -> Result<Subtask> {
        let mut tables = self.tables.lock();
        let stored = tables
            .subtasks
            .get_mut(&subtask.id)
            .ok_or_else(|| Error::NotFound(format!("subtask {}", subtask.id)))?;
        if stored.version != subtask.version {
            return Err(Error::Conflict(format!(
                "subtask {} at version {}, write based on {}",
                subtask.id, stored.version, subtask.version
            )));
        }
        *stored = subtask.clone();
        stored.version += 1;
        Ok(stored.clone())
    }

    fn list_subtasks(&self, task_id: TaskId) -> Result<Vec<Subtask>> {
        let tables = self.tables.lock();
        let mut subtasks: Vec<Subtask> = tables
            .subtasks
            .values()
            .filter(|s| s.task_id == task_id)
            .cloned()
            .collect();
        subtasks.sort_by_key(|s| (s.message_id, s.id));
        Ok(subtasks)
    }

    fn scan_reclaimable(&self, filter: &ReclaimFilter) -> Result<Vec<ReclaimCandidate>> {
        let tables = self.tables.lock();
        let candidates = tables
            .subtasks
            .values()
            .filter(|s| {
                !s.deleted
                    && s.executor_deleted_at.is_none()
                    && filter.statuses.contains(&s.status)
                    && s.updated_at < filter.updated_before
            })
            .filter_map(|s| {
                let executor = s.executor()?;
                let task = tables.tasks.get(&s.task_id)?;
                if !task.status.is_terminal() || task.updated_at >= filter.updated_before {
                    return None;
                }
                Some(ReclaimCandidate {
                    subtask_id: s.id,
                    task_id: s.task_id,
                    executor,
                    subtask_updated_at: s.updated_at,
                    task_updated_at: task.updated_at,
                    task_type: task.task_type().map(str::to_string),
                })
            })
            .collect();
        Ok(candidates)
    }

    fn mark_executor_reclaimed(
        &self,
        executor: &ExecutorHandle,
        at: DateTime<Utc>,
    ) -> Result<usize> {
        let mut tables = self.tables.lock();
        let mut marked = 0;
        for subtask in tables.subtasks.values_mut() {
            if subtask.executor_deleted_at.is_none()
                && subtask.executor().as_ref() == Some(executor)
            {
                subtask.executor_deleted_at = Some(at);
                subtask.version += 1;
                marked += 1;
            }
        }
        Ok(marked)
    }
}
