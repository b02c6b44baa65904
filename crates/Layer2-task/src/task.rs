//! Task and subtask records

use crate::chunk::{OffsetText, StepLog, Workbench};
use crate::state::Status;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Unique identifier for a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub i64);

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a subtask
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubtaskId(pub i64);

impl std::fmt::Display for SubtaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of a remote execution agent
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ExecutorHandle {
    pub namespace: String,
    pub name: String,
}

impl ExecutorHandle {
    pub const DEFAULT_NAMESPACE: &'static str = "default";

    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for ExecutorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubtaskRole {
    User,
    Assistant,
}

/// Where a subtask runs
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ExecutionTarget {
    /// In-process streaming session
    #[default]
    Local,

    /// Out-of-process agent; the name may be assigned after dispatch
    Remote {
        #[serde(default)]
        executor_name: String,
        #[serde(default = "default_namespace")]
        executor_namespace: String,
    },
}

fn default_namespace() -> String {
    ExecutorHandle::DEFAULT_NAMESPACE.to_string()
}

impl ExecutionTarget {
    pub fn remote(executor_name: impl Into<String>) -> Self {
        ExecutionTarget::Remote {
            executor_name: executor_name.into(),
            executor_namespace: default_namespace(),
        }
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, ExecutionTarget::Remote { .. })
    }

    /// Handle of the remote agent, if one has been assigned
    pub fn executor(&self) -> Option<ExecutorHandle> {
        match self {
            ExecutionTarget::Remote {
                executor_name,
                executor_namespace,
            } if !executor_name.is_empty() => {
                let namespace = if executor_namespace.is_empty() {
                    default_namespace()
                } else {
                    executor_namespace.clone()
                };
                Some(ExecutorHandle::new(namespace, executor_name.clone()))
            }
            _ => None,
        }
    }
}

/// Assembled output of a subtask
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubtaskResult {
    #[serde(default)]
    pub content: OffsetText,
    #[serde(default)]
    pub reasoning: OffsetText,
    #[serde(default)]
    pub thinking: StepLog,
    #[serde(default)]
    pub workbench: Workbench,
}

impl SubtaskResult {
    pub fn value(&self) -> &str {
        self.content.as_str()
    }
}

/// A user-visible unit of conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub user_id: i64,
    pub status: Status,
    pub progress: u8,

    /// Structured status document; `task_type` selects reaper retention
    #[serde(default)]
    pub status_doc: Value,

    #[serde(default)]
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub version: u64,
}

impl Task {
    /// New task; the store assigns the id on insert
    pub fn new(user_id: i64) -> Self {
        let now = Utc::now();
        Self {
            id: TaskId(0),
            user_id,
            status: Status::Pending,
            progress: 0,
            status_doc: Value::Object(Default::default()),
            error_message: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
            deleted: false,
            version: 0,
        }
    }

    pub fn with_task_type(mut self, task_type: impl Into<String>) -> Self {
        self.set_task_type(task_type);
        self
    }

    pub fn task_type(&self) -> Option<&str> {
        self.status_doc.get("task_type").and_then(Value::as_str)
    }

    pub fn set_task_type(&mut self, task_type: impl Into<String>) {
        if !self.status_doc.is_object() {
            self.status_doc = Value::Object(Default::default());
        }
        if let Value::Object(doc) = &mut self.status_doc {
            doc.insert("task_type".to_string(), Value::String(task_type.into()));
        }
    }

    /// Re-derive status from the most recent assistant subtask.
    ///
    /// Returns `false` (and leaves the task untouched) when there is no
    /// assistant subtask or nothing changed.
    pub fn derive_status(&mut self, subtasks: &[Subtask], now: DateTime<Utc>) -> bool {
        let Some(latest) = latest_assistant(subtasks) else {
            return false;
        };

        let before = (self.status, self.progress, self.error_message.clone());
        match latest.status {
            Status::Completed => {
                self.status = Status::Completed;
                self.progress = 100;
                self.error_message = None;
                if self.completed_at.is_none() {
                    self.completed_at = Some(latest.completed_at.unwrap_or(now));
                }
            }
            Status::Failed => {
                self.status = Status::Failed;
                self.error_message = latest.error_message.clone();
                if self.completed_at.is_none() {
                    self.completed_at = Some(latest.completed_at.unwrap_or(now));
                }
            }
            Status::Cancelled => {
                self.status = Status::Cancelled;
                self.error_message = None;
                if self.completed_at.is_none() {
                    self.completed_at = Some(latest.completed_at.unwrap_or(now));
                }
            }
            Status::Pending | Status::Running => {
                self.status = Status::Running;
                self.progress = latest.progress;
                self.error_message = None;
                self.completed_at = None;
            }
        }

        let changed = before != (self.status, self.progress, self.error_message.clone());
        if changed {
            self.updated_at = now;
        }
        changed
    }
}

fn latest_assistant(subtasks: &[Subtask]) -> Option<&Subtask> {
    subtasks
        .iter()
        .filter(|s| s.role == SubtaskRole::Assistant && !s.deleted)
        .max_by_key(|s| (s.message_id, s.id))
}

/// One turn's unit of work inside a task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subtask {
    pub id: SubtaskId,
    pub task_id: TaskId,
    pub role: SubtaskRole,

    /// Ordering within the task
    pub message_id: i64,

    #[serde(default)]
    pub prompt: String,

    #[serde(default)]
    pub target: ExecutionTarget,

    pub status: Status,
    pub progress: u8,

    #[serde(default)]
    pub result: SubtaskResult,

    #[serde(default)]
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,

    /// Set once the remote executor has been reclaimed
    #[serde(default)]
    pub executor_deleted_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub version: u64,
}

impl Subtask {
    pub fn new(task_id: TaskId, role: SubtaskRole, message_id: i64) -> Self {
        let now = Utc::now();
        Self {
            id: SubtaskId(0),
            task_id,
            role,
            message_id,
            prompt: String::new(),
            target: ExecutionTarget::Local,
            status: Status::Pending,
            progress: 0,
            result: SubtaskResult::default(),
            error_message: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
            executor_deleted_at: None,
            deleted: false,
            version: 0,
        }
    }

    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = prompt.into();
        self
    }

    pub fn with_target(mut self, target: ExecutionTarget) -> Self {
        self.target = target;
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn executor(&self) -> Option<ExecutorHandle> {
        self.target.executor()
    }

    /// Move to a new status, stamping `completed_at` on terminal states
    pub fn transition(&mut self, next: Status, now: DateTime<Utc>) -> relay_foundation::Result<()> {
        self.status = self.status.transition(next)?;
        if next.is_terminal() {
            self.completed_at.get_or_insert(now);
        }
        self.updated_at = now;
        Ok(())
    }

    /// Explicit retry back to PENDING with progress, error and result reset
    pub fn reset_for_retry(&mut self, now: DateTime<Utc>) -> relay_foundation::Result<()> {
        self.status = self.status.retry()?;
        self.progress = 0;
        self.error_message = None;
        self.result = SubtaskResult::default();
        self.completed_at = None;
        self.updated_at = now;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assistant(id: i64, message_id: i64, status: Status) -> Subtask {
        let mut s = Subtask::new(TaskId(1), SubtaskRole::Assistant, message_id);
        s.id = SubtaskId(id);
        s.status = status;
        s
    }

    #[test]
    fn test_derive_from_latest_assistant() {
        let mut task = Task::new(7);
        let mut failed = assistant(2, 2, Status::Failed);
        failed.error_message = Some("boom".into());
        let subtasks = vec![assistant(1, 1, Status::Completed), failed];

        assert!(task.derive_status(&subtasks, Utc::now()));
        assert_eq!(task.status, Status::Failed);
        assert_eq!(task.error_message.as_deref(), Some("boom"));
    }

    #[test]
    fn test_derive_completed_sets_progress() {
        let mut task = Task::new(7);
        let mut user = Subtask::new(TaskId(1), SubtaskRole::User, 3);
        user.status = Status::Pending;
        let subtasks = vec![assistant(1, 2, Status::Completed), user];

        task.derive_status(&subtasks, Utc::now());
        assert_eq!(task.status, Status::Completed);
        assert_eq!(task.progress, 100);
        assert!(task.completed_at.is_some());
    }

    #[test]
    fn test_derive_cancelled_and_running() {
        let mut task = Task::new(7);
        task.derive_status(&[assistant(1, 1, Status::Cancelled)], Utc::now());
        assert_eq!(task.status, Status::Cancelled);

        let mut task = Task::new(7);
        task.derive_status(&[assistant(1, 1, Status::Pending)], Utc::now());
        assert_eq!(task.status, Status::Running);
    }

    #[test]
    fn test_no_assistant_leaves_task_untouched() {
        let mut task = Task::new(7);
        let before = task.clone();
        let user = Subtask::new(TaskId(1), SubtaskRole::User, 1);
        assert!(!task.derive_status(&[user], Utc::now()));
        assert_eq!(task, before);
    }

    #[test]
    fn test_task_type_in_status_doc() {
        let task = Task::new(1).with_task_type("code");
        assert_eq!(task.task_type(), Some("code"));
        assert_eq!(Task::new(1).task_type(), None);
    }

    #[test]
    fn test_remote_target_without_name_has_no_executor() {
        assert_eq!(ExecutionTarget::remote("").executor(), None);
        assert_eq!(
            ExecutionTarget::remote("exec-1").executor(),
            Some(ExecutorHandle::new("default", "exec-1"))
        );
        assert_eq!(ExecutionTarget::Local.executor(), None);
    }

    #[test]
    fn test_retry_resets_subtask() {
        let mut s = assistant(1, 1, Status::Running);
        s.result.content.apply(0, "partial");
        s.transition(Status::Failed, Utc::now()).unwrap();
        s.error_message = Some("x".into());

        s.reset_for_retry(Utc::now()).unwrap();
        assert_eq!(s.status, Status::Pending);
        assert_eq!(s.result.value(), "");
        assert!(s.error_message.is_none());
        assert!(s.completed_at.is_none());
    }
}
