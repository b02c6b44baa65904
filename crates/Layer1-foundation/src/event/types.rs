//! Event Types - lifecycle events published across Relay layers

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ============================================================================
// Event ID
// ============================================================================

/// Unique event identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventId(pub String);

impl EventId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Event Category
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventCategory {
    /// Process-level events (startup, shutdown)
    System,
    /// Subtask/task status changes
    Subtask,
    /// Persisted stream chunks
    Chunk,
    /// Remote executor lifecycle (dispatch, cancel, reclaim)
    Executor,
    /// Pending interactive requests
    Interactive,
}

impl EventCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::Subtask => "subtask",
            Self::Chunk => "chunk",
            Self::Executor => "executor",
            Self::Interactive => "interactive",
        }
    }
}

// ============================================================================
// Event Severity
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSeverity {
    Debug,
    #[default]
    Info,
    Warning,
    Error,
}

// ============================================================================
// RelayEvent
// ============================================================================

/// An event published on the [`EventBus`](super::EventBus)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayEvent {
    pub id: EventId,

    /// Dotted event type, e.g. `subtask.status_changed`
    pub event_type: String,

    pub category: EventCategory,

    pub severity: EventSeverity,

    pub timestamp: DateTime<Utc>,

    /// Emitting module
    pub source: String,

    pub data: Value,
}

impl RelayEvent {
    pub fn new(event_type: impl Into<String>, category: EventCategory) -> Self {
        Self {
            id: EventId::new(),
            event_type: event_type.into(),
            category,
            severity: EventSeverity::Info,
            timestamp: Utc::now(),
            source: String::new(),
            data: Value::Null,
        }
    }

    pub fn with_severity(mut self, severity: EventSeverity) -> Self {
        self.severity = severity;
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }
}

// ============================================================================
// Predefined events
// ============================================================================

/// Subtask lifecycle events
pub mod subtask {
    use super::*;

    pub fn status_changed(task_id: i64, subtask_id: i64, status: &str, progress: u8) -> RelayEvent {
        RelayEvent::new("subtask.status_changed", EventCategory::Subtask)
            .with_source("bridge")
            .with_data(serde_json::json!({
                "task_id": task_id,
                "subtask_id": subtask_id,
                "status": status,
                "progress": progress,
            }))
    }

    pub fn cancelled(task_id: i64, subtask_id: i64, path: &str) -> RelayEvent {
        RelayEvent::new("subtask.cancelled", EventCategory::Subtask)
            .with_source("cancel")
            .with_data(serde_json::json!({
                "task_id": task_id,
                "subtask_id": subtask_id,
                "path": path,
            }))
    }

    pub fn task_status_changed(task_id: i64, status: &str) -> RelayEvent {
        RelayEvent::new("task.status_changed", EventCategory::Subtask)
            .with_source("bridge")
            .with_data(serde_json::json!({
                "task_id": task_id,
                "status": status,
            }))
    }
}

/// Chunk persistence events
pub mod chunk {
    use super::*;

    pub fn persisted(task_id: i64, subtask_id: i64, chunk_type: &str) -> RelayEvent {
        RelayEvent::new("chunk.persisted", EventCategory::Chunk)
            .with_severity(EventSeverity::Debug)
            .with_source("bridge")
            .with_data(serde_json::json!({
                "task_id": task_id,
                "subtask_id": subtask_id,
                "chunk_type": chunk_type,
            }))
    }
}

/// Remote executor events
pub mod executor {
    use super::*;

    pub fn reclaimed(namespace: &str, name: &str, subtasks: usize) -> RelayEvent {
        RelayEvent::new("executor.reclaimed", EventCategory::Executor)
            .with_source("reaper")
            .with_data(serde_json::json!({
                "namespace": namespace,
                "name": name,
                "subtasks": subtasks,
            }))
    }

    pub fn reclaim_failed(namespace: &str, name: &str, error: &str) -> RelayEvent {
        RelayEvent::new("executor.reclaim_failed", EventCategory::Executor)
            .with_severity(EventSeverity::Warning)
            .with_source("reaper")
            .with_data(serde_json::json!({
                "namespace": namespace,
                "name": name,
                "error": error,
            }))
    }

    pub fn cancel_failed(task_id: i64, error: &str) -> RelayEvent {
        RelayEvent::new("executor.cancel_failed", EventCategory::Executor)
            .with_severity(EventSeverity::Warning)
            .with_source("cancel")
            .with_data(serde_json::json!({
                "task_id": task_id,
                "error": error,
            }))
    }
}

/// Pending interactive request events
pub mod interactive {
    use super::*;

    pub fn expired(request_id: &str, skill: &str) -> RelayEvent {
        RelayEvent::new("interactive.expired", EventCategory::Interactive)
            .with_severity(EventSeverity::Warning)
            .with_source("interactive")
            .with_data(serde_json::json!({
                "request_id": request_id,
                "skill": skill,
            }))
    }
}
