//! # relay-task
//!
//! Subtask lifecycle and streaming-result persistence for Relay.
//! Incremental output from local streams and remote agents is merged into
//! durable subtask records, cancelled on request, and reclaimed when stale.
//!
//! ## Features
//!
//! - Subtask state machine with terminal-state protection
//! - Offset-addressed chunk merging (content, reasoning, thinking, workbench)
//! - Persistence bridge with per-subtask ordering and optimistic writes
//! - Local and remote executors, plus a PTY process wrapper
//! - **Cancellation routed by execution target**
//! - **Stale executor reaper**
//! - **Pending interactive requests with timeouts**

pub mod bridge;
pub mod cancel;
pub mod chunk;
pub mod executor;
pub mod interactive;
pub mod manager;
pub mod pool;
pub mod reaper;
pub mod state;
pub mod store;
pub mod task;

// Data model
pub use chunk::{
    AppendOutcome, CallbackPayload, Chunk, ChunkError, ChunkPayload, ChunkType, FileChange,
    FileChangeType, GitCommit, OffsetText, StepLog, StepStatus, ThinkingStep, Workbench,
    WorkbenchDelta,
};
pub use state::Status;
pub use task::{
    ExecutionTarget, ExecutorHandle, Subtask, SubtaskId, SubtaskResult, SubtaskRole, Task, TaskId,
};

// Persistence
pub use bridge::{apply_chunk_to, ApplyOutcome, PersistenceBridge, DEFAULT_FAILURE_MESSAGE};
pub use pool::BlockingPool;
pub use store::{InMemoryStore, ReclaimCandidate, ReclaimFilter, SqliteStore, TaskStore};

// Execution
pub use executor::{
    CancelAck, CancelSignal, ChunkSink, Executor, ExecutorRpc, HttpExecutorClient, LocalExecutor,
    LocalStreamRegistry, PtyCommand, PtyProcess, RemoteExecutor, StreamLease, StreamProducer,
    StreamProtocol,
};
pub use manager::{SubtaskManager, Turn};

// Lifecycle services
pub use cancel::{CancelOutcome, CancelPath, CancellationCoordinator};
pub use interactive::{
    InteractiveError, InteractiveResult, PendingHandle, PendingRequestInfo, PendingRequestRegistry,
};
pub use reaper::{ReapReport, StaleExecutorReaper};
