//! Chunk protocol - incremental updates for one subtask
//!
//! Every chunk is an immutable increment tagged with its task and subtask.
//! Text kinds carry only the delta plus the absolute character offset of its
//! start, so receivers can drop repeats and reassemble out-of-order arrivals.
//! Thinking steps are addressed by slot and upserted. Workbench deltas are
//! sparse: a missing key means "unchanged".

use crate::state::Status;
use crate::task::{ExecutorHandle, SubtaskId, TaskId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;

// ============================================================================
// Chunk types
// ============================================================================

/// Wire tag of a chunk (`chunk_type` on the callback ingress)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChunkType {
    Content,
    Thinking,
    Reasoning,
    WorkbenchDelta,
    Status,
}

impl ChunkType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkType::Content => "chunk",
            ChunkType::Thinking => "thinking",
            ChunkType::Reasoning => "reasoning",
            ChunkType::WorkbenchDelta => "workbench_delta",
            ChunkType::Status => "status",
        }
    }

    pub fn from_wire(tag: &str) -> Result<Self, ChunkError> {
        match tag {
            "chunk" => Ok(ChunkType::Content),
            "thinking" => Ok(ChunkType::Thinking),
            "reasoning" => Ok(ChunkType::Reasoning),
            "workbench_delta" => Ok(ChunkType::WorkbenchDelta),
            "status" => Ok(ChunkType::Status),
            other => Err(ChunkError::UnknownType(other.to_string())),
        }
    }
}

impl std::fmt::Display for ChunkType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum ChunkError {
    #[error("unknown chunk_type: {0}")]
    UnknownType(String),

    #[error("malformed {chunk_type} data: {message}")]
    MalformedData {
        chunk_type: &'static str,
        message: String,
    },

    #[error("progress out of range: {0}")]
    InvalidProgress(u64),
}

impl From<ChunkError> for relay_foundation::Error {
    fn from(e: ChunkError) -> Self {
        relay_foundation::Error::InvalidInput(e.to_string())
    }
}

// ============================================================================
// Thinking steps
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Running,
    Completed,
    Failed,
}

/// One structured step of a tool-using turn
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThinkingStep {
    pub title: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,

    pub status: StepStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,

    /// Pairs a tool-invocation step with its later tool-result step
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
}

impl ThinkingStep {
    pub fn new(title: impl Into<String>, status: StepStatus) -> Self {
        Self {
            title: title.into(),
            tool_name: None,
            status,
            details: None,
            run_id: None,
        }
    }

    pub fn with_tool(mut self, tool_name: impl Into<String>) -> Self {
        self.tool_name = Some(tool_name.into());
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }
}

/// Steps keyed by slot; a later write to the same slot replaces the earlier one
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepLog(BTreeMap<usize, ThinkingStep>);

impl StepLog {
    /// Returns `true` when an existing step was replaced
    pub fn upsert(&mut self, index: usize, step: ThinkingStep) -> bool {
        self.0.insert(index, step).is_some()
    }

    pub fn get(&self, index: usize) -> Option<&ThinkingStep> {
        self.0.get(&index)
    }

    pub fn steps(&self) -> impl Iterator<Item = (&usize, &ThinkingStep)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// First slot after the highest one in use
    pub fn next_index(&self) -> usize {
        self.0.keys().next_back().map(|i| i + 1).unwrap_or(0)
    }
}

// ============================================================================
// Offset-addressed text
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// New characters were added to the contiguous text
    Appended,
    /// Everything in the delta was already present
    Duplicate,
    /// Delta starts past the current end; held until the gap fills
    Buffered,
}

/// Text reassembled from `(offset, delta)` pairs; offsets count characters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OffsetText {
    pub text: String,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pending: BTreeMap<usize, String>,
}

impl OffsetText {
    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn char_len(&self) -> usize {
        self.text.chars().count()
    }

    /// Fragments still waiting for an earlier gap
    pub fn has_gaps(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn apply(&mut self, offset: usize, delta: &str) -> AppendOutcome {
        if delta.is_empty() {
            return AppendOutcome::Duplicate;
        }

        let len = self.char_len();
        if offset > len {
            let keep_existing = self
                .pending
                .get(&offset)
                .is_some_and(|existing| existing.chars().count() >= delta.chars().count());
            if !keep_existing {
                self.pending.insert(offset, delta.to_string());
            }
            return AppendOutcome::Buffered;
        }

        if !self.append_tail(offset, delta, len) {
            return AppendOutcome::Duplicate;
        }
        self.flush_pending();
        AppendOutcome::Appended
    }

    /// Append the part of `delta` beyond `len`; false when nothing is new
    fn append_tail(&mut self, offset: usize, delta: &str, len: usize) -> bool {
        let delta_len = delta.chars().count();
        if offset + delta_len <= len {
            return false;
        }
        self.text.extend(delta.chars().skip(len - offset));
        true
    }

    fn flush_pending(&mut self) {
        while let Some((offset, fragment)) = self.pending.pop_first() {
            let len = self.char_len();
            if offset > len {
                self.pending.insert(offset, fragment);
                break;
            }
            self.append_tail(offset, &fragment, len);
        }
    }

    pub fn clear(&mut self) {
        self.text.clear();
        self.pending.clear();
    }
}

// ============================================================================
// Workbench
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileChangeType {
    Added,
    Modified,
    Deleted,
    Renamed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileChange {
    pub path: String,
    pub change_type: FileChangeType,
    #[serde(default)]
    pub additions: u32,
    #[serde(default)]
    pub deletions: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GitCommit {
    pub sha: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
}

/// Sparse patch of side-effect state
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkbenchDelta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_changes: Option<Vec<FileChange>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_commits: Option<Vec<GitCommit>>,
}

impl WorkbenchDelta {
    pub fn is_empty(&self) -> bool {
        self.status.is_none()
            && self.error.is_none()
            && self.summary.is_none()
            && self.file_changes.is_none()
            && self.git_commits.is_none()
    }
}

/// Merged workbench view
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Workbench {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default)]
    pub file_changes: Vec<FileChange>,
    #[serde(default)]
    pub git_commits: Vec<GitCommit>,
}

impl Workbench {
    /// Merge only the keys present in `delta`
    pub fn merge(&mut self, delta: &WorkbenchDelta) {
        if let Some(status) = &delta.status {
            self.status = Some(status.clone());
        }
        if let Some(error) = &delta.error {
            self.error = Some(error.clone());
        }
        if let Some(summary) = &delta.summary {
            self.summary = Some(summary.clone());
        }
        if let Some(changes) = &delta.file_changes {
            self.file_changes = changes.clone();
        }
        if let Some(commits) = &delta.git_commits {
            self.git_commits = commits.clone();
        }
    }
}

// ============================================================================
// Chunk
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum ChunkPayload {
    Content {
        content: String,
        offset: usize,
    },
    Reasoning {
        content: String,
        offset: usize,
    },
    ThinkingStep {
        step_index: usize,
        step: ThinkingStep,
    },
    WorkbenchDelta(WorkbenchDelta),
    Status {
        status: Status,
        progress: u8,
        error_message: Option<String>,
    },
}

impl ChunkPayload {
    pub fn chunk_type(&self) -> ChunkType {
        match self {
            ChunkPayload::Content { .. } => ChunkType::Content,
            ChunkPayload::Reasoning { .. } => ChunkType::Reasoning,
            ChunkPayload::ThinkingStep { .. } => ChunkType::Thinking,
            ChunkPayload::WorkbenchDelta(_) => ChunkType::WorkbenchDelta,
            ChunkPayload::Status { .. } => ChunkType::Status,
        }
    }

    pub fn status(status: Status, progress: u8) -> Self {
        ChunkPayload::Status {
            status,
            progress,
            error_message: None,
        }
    }

    pub fn failed(error_message: impl Into<String>) -> Self {
        ChunkPayload::Status {
            status: Status::Failed,
            progress: 100,
            error_message: Some(error_message.into()),
        }
    }
}

/// One incremental update belonging to exactly one subtask
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub task_id: TaskId,
    pub subtask_id: SubtaskId,
    pub timestamp: DateTime<Utc>,
    pub payload: ChunkPayload,

    /// Remote agent that produced the chunk, if any
    pub executor: Option<ExecutorHandle>,

    /// Task category, used by the reaper's retention override
    pub task_type: Option<String>,
}

impl Chunk {
    pub fn new(task_id: TaskId, subtask_id: SubtaskId, payload: ChunkPayload) -> Self {
        Self {
            task_id,
            subtask_id,
            timestamp: Utc::now(),
            payload,
            executor: None,
            task_type: None,
        }
    }

    pub fn with_executor(mut self, executor: ExecutorHandle) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn with_task_type(mut self, task_type: impl Into<String>) -> Self {
        self.task_type = Some(task_type.into());
        self
    }

    pub fn chunk_type(&self) -> ChunkType {
        self.payload.chunk_type()
    }

    pub fn is_terminal_status(&self) -> bool {
        matches!(&self.payload, ChunkPayload::Status { status, .. } if status.is_terminal())
    }
}

// ============================================================================
// Wire representation
// ============================================================================

/// Callback ingress envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallbackPayload {
    pub task_id: TaskId,
    pub subtask_id: SubtaskId,
    pub chunk_type: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executor_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executor_namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Serialize, Deserialize)]
struct TextData {
    content: String,
    #[serde(default)]
    offset: usize,
}

#[derive(Serialize, Deserialize)]
struct StepData {
    step_index: usize,
    step: ThinkingStep,
}

#[derive(Serialize, Deserialize)]
struct StatusData {
    status: Status,
    #[serde(default)]
    progress: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error_message: Option<String>,
}

fn decode<T: serde::de::DeserializeOwned>(kind: ChunkType, data: Value) -> Result<T, ChunkError> {
    serde_json::from_value(data).map_err(|e| ChunkError::MalformedData {
        chunk_type: kind.as_str(),
        message: e.to_string(),
    })
}

impl TryFrom<CallbackPayload> for Chunk {
    type Error = ChunkError;

    fn try_from(wire: CallbackPayload) -> Result<Self, Self::Error> {
        let kind = ChunkType::from_wire(&wire.chunk_type)?;
        let payload = match kind {
            ChunkType::Content => {
                let d: TextData = decode(kind, wire.data)?;
                ChunkPayload::Content {
                    content: d.content,
                    offset: d.offset,
                }
            }
            ChunkType::Reasoning => {
                let d: TextData = decode(kind, wire.data)?;
                ChunkPayload::Reasoning {
                    content: d.content,
                    offset: d.offset,
                }
            }
            ChunkType::Thinking => {
                let d: StepData = decode(kind, wire.data)?;
                ChunkPayload::ThinkingStep {
                    step_index: d.step_index,
                    step: d.step,
                }
            }
            ChunkType::WorkbenchDelta => ChunkPayload::WorkbenchDelta(decode(kind, wire.data)?),
            ChunkType::Status => {
                let d: StatusData = decode(kind, wire.data)?;
                if d.progress > 100 {
                    return Err(ChunkError::InvalidProgress(d.progress));
                }
                ChunkPayload::Status {
                    status: d.status,
                    progress: d.progress as u8,
                    error_message: d.error_message,
                }
            }
        };

        let executor = match wire.executor_name {
            Some(name) if !name.is_empty() => Some(ExecutorHandle::new(
                wire.executor_namespace
                    .filter(|ns| !ns.is_empty())
                    .unwrap_or_else(|| ExecutorHandle::DEFAULT_NAMESPACE.to_string()),
                name,
            )),
            _ => None,
        };

        Ok(Chunk {
            task_id: wire.task_id,
            subtask_id: wire.subtask_id,
            timestamp: wire.timestamp.unwrap_or_else(Utc::now),
            payload,
            executor,
            task_type: wire.task_type,
        })
    }
}

impl From<&Chunk> for CallbackPayload {
    fn from(chunk: &Chunk) -> Self {
        let data = match &chunk.payload {
            ChunkPayload::Content { content, offset } | ChunkPayload::Reasoning { content, offset } => {
                serde_json::json!({ "content": content, "offset": offset })
            }
            ChunkPayload::ThinkingStep { step_index, step } => {
                serde_json::json!({ "step_index": step_index, "step": step })
            }
            ChunkPayload::WorkbenchDelta(delta) => {
                serde_json::to_value(delta).unwrap_or(Value::Null)
            }
            ChunkPayload::Status {
                status,
                progress,
                error_message,
            } => serde_json::to_value(StatusData {
                status: *status,
                progress: u64::from(*progress),
                error_message: error_message.clone(),
            })
            .unwrap_or(Value::Null),
        };

        CallbackPayload {
            task_id: chunk.task_id,
            subtask_id: chunk.subtask_id,
            chunk_type: chunk.chunk_type().as_str().to_string(),
            data,
            executor_name: chunk.executor.as_ref().map(|e| e.name.clone()),
            executor_namespace: chunk.executor.as_ref().map(|e| e.namespace.clone()),
            task_type: chunk.task_type.clone(),
            timestamp: Some(chunk.timestamp),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offsets_tolerate_any_delivery_order() {
        let parts = [(0, "Th"), (2, "e q"), (5, "uick "), (10, "fox")];
        let orders: [[usize; 4]; 4] = [[0, 1, 2, 3], [3, 2, 1, 0], [1, 3, 0, 2], [2, 0, 3, 1]];

        for order in orders {
            let mut text = OffsetText::default();
            for i in order {
                let (offset, delta) = parts[i];
                text.apply(offset, delta);
            }
            assert_eq!(text.as_str(), "The quick fox", "order {order:?}");
            assert!(!text.has_gaps());
        }
    }

    #[test]
    fn test_repeat_is_discarded() {
        let mut text = OffsetText::default();
        assert_eq!(text.apply(0, "He"), AppendOutcome::Appended);
        assert_eq!(text.apply(0, "He"), AppendOutcome::Duplicate);
        assert_eq!(text.apply(2, "llo"), AppendOutcome::Appended);
        assert_eq!(text.apply(1, "el"), AppendOutcome::Duplicate);
        assert_eq!(text.as_str(), "Hello");
    }

    #[test]
    fn test_partial_overlap_appends_unseen_suffix() {
        let mut text = OffsetText::default();
        text.apply(0, "Hel");
        assert_eq!(text.apply(1, "ello!"), AppendOutcome::Appended);
        assert_eq!(text.as_str(), "Hello!");
    }

    #[test]
    fn test_offsets_count_characters() {
        let mut text = OffsetText::default();
        text.apply(0, "héllo ");
        text.apply(6, "wörld");
        assert_eq!(text.as_str(), "héllo wörld");
        assert_eq!(text.char_len(), 11);
    }

    #[test]
    fn test_gap_is_buffered() {
        let mut text = OffsetText::default();
        assert_eq!(text.apply(3, "lo"), AppendOutcome::Buffered);
        assert_eq!(text.as_str(), "");
        assert!(text.has_gaps());
        text.apply(0, "Hel");
        assert_eq!(text.as_str(), "Hello");
    }

    #[test]
    fn test_step_upsert_last_write_wins() {
        let mut log = StepLog::default();
        assert!(!log.upsert(0, ThinkingStep::new("search", StepStatus::Running)));
        assert!(log.upsert(0, ThinkingStep::new("search", StepStatus::Completed)));
        log.upsert(1, ThinkingStep::new("result", StepStatus::Completed));

        assert_eq!(log.len(), 2);
        assert_eq!(log.get(0).unwrap().status, StepStatus::Completed);
        assert_eq!(log.next_index(), 2);
    }

    #[test]
    fn test_workbench_status_only_keeps_file_changes() {
        let mut bench = Workbench::default();
        bench.merge(&WorkbenchDelta {
            file_changes: Some(vec![FileChange {
                path: "src/main.rs".into(),
                change_type: FileChangeType::Modified,
                additions: 3,
                deletions: 1,
            }]),
            ..Default::default()
        });

        let status_only: WorkbenchDelta =
            serde_json::from_value(serde_json::json!({ "status": "completed" })).unwrap();
        bench.merge(&status_only);

        assert_eq!(bench.status.as_deref(), Some("completed"));
        assert_eq!(bench.file_changes.len(), 1);
        assert_eq!(bench.file_changes[0].path, "src/main.rs");
    }

    #[test]
    fn test_wire_decoding() {
        let wire: CallbackPayload = serde_json::from_value(serde_json::json!({
            "task_id": 3,
            "subtask_id": 42,
            "chunk_type": "thinking",
            "data": {
                "step_index": 1,
                "step": { "title": "Run search", "tool_name": "search", "status": "running", "run_id": "c1" }
            },
            "executor_name": "exec-1",
            "task_type": "code"
        }))
        .unwrap();

        let chunk = Chunk::try_from(wire).unwrap();
        assert_eq!(chunk.subtask_id, SubtaskId(42));
        assert_eq!(chunk.chunk_type(), ChunkType::Thinking);
        assert_eq!(
            chunk.executor,
            Some(ExecutorHandle::new("default", "exec-1"))
        );
        assert_eq!(chunk.task_type.as_deref(), Some("code"));
        match chunk.payload {
            ChunkPayload::ThinkingStep { step_index, step } => {
                assert_eq!(step_index, 1);
                assert_eq!(step.run_id.as_deref(), Some("c1"));
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn test_wire_rejects_bad_input() {
        let unknown = CallbackPayload {
            task_id: TaskId(1),
            subtask_id: SubtaskId(1),
            chunk_type: "telemetry".into(),
            data: Value::Null,
            executor_name: None,
            executor_namespace: None,
            task_type: None,
            timestamp: None,
        };
        assert!(matches!(
            Chunk::try_from(unknown.clone()),
            Err(ChunkError::UnknownType(_))
        ));

        let bad_progress = CallbackPayload {
            chunk_type: "status".into(),
            data: serde_json::json!({ "status": "RUNNING", "progress": 140 }),
            ..unknown.clone()
        };
        assert!(matches!(
            Chunk::try_from(bad_progress),
            Err(ChunkError::InvalidProgress(140))
        ));

        let missing_content = CallbackPayload {
            chunk_type: "chunk".into(),
            data: serde_json::json!({ "offset": 3 }),
            ..unknown
        };
        assert!(matches!(
            Chunk::try_from(missing_content),
            Err(ChunkError::MalformedData { .. })
        ));
    }

    #[test]
    fn test_wire_encoding_of_status() {
        let chunk = Chunk::new(
            TaskId(1),
            SubtaskId(2),
            ChunkPayload::failed("executor crashed"),
        );
        let wire = CallbackPayload::from(&chunk);
        assert_eq!(wire.chunk_type, "status");
        assert_eq!(wire.data["status"], "FAILED");
        assert_eq!(wire.data["error_message"], "executor crashed");
    }
}
