//! Local executor - runs an in-process streaming producer
//!
//! Two stream protocol versions coexist. The legacy one stops on a shared
//! flag, the current one on a cancellation token. Whichever version most
//! recently announced a subtask owns its cancellation.
//!
//! Producers write through a [`ChunkSink`], which assigns text offsets,
//! persists through the bridge and checks for cancellation before every
//! chunk.

use crate::bridge::PersistenceBridge;
use crate::chunk::{Chunk, ChunkPayload, ThinkingStep, WorkbenchDelta};
use crate::executor::{CancelAck, Executor};
use crate::state::Status;
use crate::task::{Subtask, SubtaskId, TaskId};
use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use relay_foundation::{Error, Result};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const FLAG_POLL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamProtocol {
    /// Stops when a shared flag is set
    Legacy,
    /// Stops when a cancellation token fires
    Current,
}

/// Stop signal of one local stream
#[derive(Debug, Clone)]
pub enum CancelSignal {
    Flag(Arc<AtomicBool>),
    Token(CancellationToken),
}

impl CancelSignal {
    pub fn for_protocol(protocol: StreamProtocol) -> Self {
        match protocol {
            StreamProtocol::Legacy => CancelSignal::Flag(Arc::new(AtomicBool::new(false))),
            StreamProtocol::Current => CancelSignal::Token(CancellationToken::new()),
        }
    }

    pub fn protocol(&self) -> StreamProtocol {
        match self {
            CancelSignal::Flag(_) => StreamProtocol::Legacy,
            CancelSignal::Token(_) => StreamProtocol::Current,
        }
    }

    pub fn fire(&self) {
        match self {
            CancelSignal::Flag(flag) => flag.store(true, Ordering::SeqCst),
            CancelSignal::Token(token) => token.cancel(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        match self {
            CancelSignal::Flag(flag) => flag.load(Ordering::SeqCst),
            CancelSignal::Token(token) => token.is_cancelled(),
        }
    }

    /// Resolves once the signal fires. The legacy flag has no waker and is
    /// polled.
    pub async fn cancelled(&self) {
        match self {
            CancelSignal::Flag(flag) => {
                while !flag.load(Ordering::SeqCst) {
                    tokio::time::sleep(FLAG_POLL).await;
                }
            }
            CancelSignal::Token(token) => token.cancelled().await,
        }
    }
}

/// Proof of ownership returned by [`LocalStreamRegistry::announce`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamLease(u64);

struct Owner {
    lease: StreamLease,
    signal: CancelSignal,
}

/// Which local stream currently owns each subtask
#[derive(Default)]
pub struct LocalStreamRegistry {
    owners: Mutex<HashMap<SubtaskId, Owner>>,
    next_lease: AtomicU64,
}

impl LocalStreamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim ownership of `id`; the most recent announcement wins
    pub fn announce(&self, id: SubtaskId, signal: CancelSignal) -> StreamLease {
        let lease = StreamLease(self.next_lease.fetch_add(1, Ordering::SeqCst));
        let protocol = signal.protocol();
        let previous = self.owners.lock().insert(id, Owner { lease, signal });
        if let Some(previous) = previous {
            debug!(
                subtask_id = %id,
                from = ?previous.signal.protocol(),
                to = ?protocol,
                "Local stream ownership replaced"
            );
        }
        lease
    }

    /// Fire the owner's signal; returns the owner's protocol, if any
    pub fn cancel(&self, id: SubtaskId) -> Option<StreamProtocol> {
        let signal = self.owners.lock().get(&id).map(|o| o.signal.clone());
        signal.map(|signal| {
            signal.fire();
            signal.protocol()
        })
    }

    /// Drop ownership if `lease` is still the current owner
    pub fn release(&self, id: SubtaskId, lease: StreamLease) -> bool {
        let mut owners = self.owners.lock();
        if owners.get(&id).map(|o| o.lease) == Some(lease) {
            owners.remove(&id);
            true
        } else {
            false
        }
    }

    pub fn owner(&self, id: SubtaskId) -> Option<StreamProtocol> {
        self.owners.lock().get(&id).map(|o| o.signal.protocol())
    }

    pub fn len(&self) -> usize {
        self.owners.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Write side handed to a producer
pub struct ChunkSink {
    bridge: Arc<PersistenceBridge>,
    task_id: TaskId,
    subtask_id: SubtaskId,
    signal: CancelSignal,
    content_offset: usize,
    reasoning_offset: usize,
    next_step: usize,
}

impl ChunkSink {
    pub fn new(bridge: Arc<PersistenceBridge>, subtask: &Subtask, signal: CancelSignal) -> Self {
        Self {
            bridge,
            task_id: subtask.task_id,
            subtask_id: subtask.id,
            signal,
            content_offset: subtask.result.content.char_len(),
            reasoning_offset: subtask.result.reasoning.char_len(),
            next_step: subtask.result.thinking.next_index(),
        }
    }

    pub fn subtask_id(&self) -> SubtaskId {
        self.subtask_id
    }

    pub fn is_cancelled(&self) -> bool {
        self.signal.is_cancelled()
    }

    /// Resolves once the stream has been asked to stop; for racing work that
    /// emits no chunks
    pub async fn cancelled(&self) {
        self.signal.cancelled().await
    }

    /// `Err(Cancelled)` once the stream has been asked to stop
    pub fn check_cancelled(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }

    async fn emit(&mut self, payload: ChunkPayload) -> Result<()> {
        self.check_cancelled()?;
        self.bridge
            .apply_chunk(Chunk::new(self.task_id, self.subtask_id, payload))
            .await?;
        Ok(())
    }

    pub async fn content(&mut self, delta: &str) -> Result<()> {
        if delta.is_empty() {
            return self.check_cancelled();
        }
        let offset = self.content_offset;
        self.emit(ChunkPayload::Content {
            content: delta.to_string(),
            offset,
        })
        .await?;
        self.content_offset += delta.chars().count();
        Ok(())
    }

    pub async fn reasoning(&mut self, delta: &str) -> Result<()> {
        if delta.is_empty() {
            return self.check_cancelled();
        }
        let offset = self.reasoning_offset;
        self.emit(ChunkPayload::Reasoning {
            content: delta.to_string(),
            offset,
        })
        .await?;
        self.reasoning_offset += delta.chars().count();
        Ok(())
    }

    /// Reserve the next thinking-step slot
    pub fn next_step_index(&mut self) -> usize {
        let index = self.next_step;
        self.next_step += 1;
        index
    }

    pub async fn thinking_step(&mut self, step_index: usize, step: ThinkingStep) -> Result<()> {
        self.emit(ChunkPayload::ThinkingStep { step_index, step }).await
    }

    pub async fn workbench(&mut self, delta: WorkbenchDelta) -> Result<()> {
        if delta.is_empty() {
            return self.check_cancelled();
        }
        self.emit(ChunkPayload::WorkbenchDelta(delta)).await
    }

    pub async fn progress(&mut self, progress: u8) -> Result<()> {
        self.emit(ChunkPayload::status(Status::Running, progress))
            .await
    }

    /// Characters of content emitted so far
    pub fn content_len(&self) -> usize {
        self.content_offset
    }
}

/// Something that streams a subtask's output into a sink
#[async_trait]
pub trait StreamProducer: Send + Sync {
    /// Produce output until done. Returning `Err(Cancelled)` means the sink
    /// reported a stop request.
    async fn run(&self, subtask: Subtask, sink: ChunkSink) -> Result<()>;

    fn protocol(&self) -> StreamProtocol {
        StreamProtocol::Current
    }
}

/// Executor for in-process streams
pub struct LocalExecutor {
    bridge: Arc<PersistenceBridge>,
    registry: Arc<LocalStreamRegistry>,
    producer: Arc<dyn StreamProducer>,
    running: Mutex<HashMap<SubtaskId, JoinHandle<()>>>,
}

impl LocalExecutor {
    pub fn new(
        bridge: Arc<PersistenceBridge>,
        registry: Arc<LocalStreamRegistry>,
        producer: Arc<dyn StreamProducer>,
    ) -> Self {
        Self {
            bridge,
            registry,
            producer,
            running: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &Arc<LocalStreamRegistry> {
        &self.registry
    }

    /// Wait for the producer task of `id` to finish
    pub async fn join(&self, id: SubtaskId) {
        let handle = self.running.lock().remove(&id);
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(subtask_id = %id, error = %e, "Local stream task aborted");
            }
        }
    }

    async fn drive(
        bridge: Arc<PersistenceBridge>,
        producer: Arc<dyn StreamProducer>,
        subtask: Subtask,
        signal: CancelSignal,
    ) {
        let id = subtask.id;
        let task_id = subtask.task_id;
        let sink = ChunkSink::new(Arc::clone(&bridge), &subtask, signal.clone());

        let outcome = AssertUnwindSafe(producer.run(subtask, sink))
            .catch_unwind()
            .await;

        let terminal = match outcome {
            Ok(Ok(())) if signal.is_cancelled() => None,
            Ok(Ok(())) => Some(ChunkPayload::status(Status::Completed, 100)),
            Ok(Err(Error::Cancelled)) => {
                debug!(subtask_id = %id, "Local stream stopped on cancel");
                None
            }
            Ok(Err(e)) => {
                warn!(subtask_id = %id, error = %e, "Local stream failed");
                Some(ChunkPayload::failed(e.to_string()))
            }
            Err(_) => {
                error!(subtask_id = %id, "Local stream panicked");
                Some(ChunkPayload::failed("stream producer panicked"))
            }
        };

        if let Some(payload) = terminal {
            if let Err(e) = bridge.apply_chunk(Chunk::new(task_id, id, payload)).await {
                error!(subtask_id = %id, error = %e, "Failed to record stream outcome");
            }
        }
    }
}

#[async_trait]
impl Executor for LocalExecutor {
    async fn start(&self, subtask: &Subtask) -> Result<()> {
        if subtask.is_terminal() {
            return Err(Error::transition(subtask.status, Status::Running));
        }

        let signal = CancelSignal::for_protocol(self.producer.protocol());
        let lease = self.registry.announce(subtask.id, signal.clone());
        info!(subtask_id = %subtask.id, protocol = ?signal.protocol(), "Starting local stream");

        let bridge = Arc::clone(&self.bridge);
        let registry = Arc::clone(&self.registry);
        let producer = Arc::clone(&self.producer);
        let subtask = subtask.clone();
        let id = subtask.id;

        let handle = tokio::spawn(async move {
            Self::drive(bridge, producer, subtask, signal).await;
            registry.release(id, lease);
        });
        let mut running = self.running.lock();
        running.retain(|_, h| !h.is_finished());
        running.insert(id, handle);
        Ok(())
    }

    async fn cancel(&self, subtask: &Subtask) -> Result<CancelAck> {
        let stopped_stream = self.registry.cancel(subtask.id);
        match stopped_stream {
            Some(protocol) => {
                info!(subtask_id = %subtask.id, ?protocol, "Local stream cancel signalled");
            }
            None => debug!(subtask_id = %subtask.id, "No live local stream to cancel"),
        }
        Ok(CancelAck { stopped_stream })
    }

    fn name(&self) -> &'static str {
        "local"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_last_announcement_wins() {
        let registry = LocalStreamRegistry::new();
        let legacy = CancelSignal::for_protocol(StreamProtocol::Legacy);
        let current = CancelSignal::for_protocol(StreamProtocol::Current);

        let first = registry.announce(SubtaskId(1), legacy.clone());
        let second = registry.announce(SubtaskId(1), current.clone());

        assert_eq!(registry.cancel(SubtaskId(1)), Some(StreamProtocol::Current));
        assert!(current.is_cancelled());
        assert!(!legacy.is_cancelled());

        // A stale owner cannot release the new one
        assert!(!registry.release(SubtaskId(1), first));
        assert!(registry.release(SubtaskId(1), second));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_cancel_unknown_subtask() {
        let registry = LocalStreamRegistry::new();
        assert_eq!(registry.cancel(SubtaskId(9)), None);
    }

    #[test]
    fn test_legacy_flag_signal() {
        let signal = CancelSignal::for_protocol(StreamProtocol::Legacy);
        assert!(!signal.is_cancelled());
        signal.fire();
        assert!(signal.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancelled_resolves_for_both_protocols() {
        for protocol in [StreamProtocol::Legacy, StreamProtocol::Current] {
            let signal = CancelSignal::for_protocol(protocol);
            let waiter = {
                let signal = signal.clone();
                tokio::spawn(async move { signal.cancelled().await })
            };
            tokio::task::yield_now().await;
            assert!(!waiter.is_finished());

            signal.fire();
            tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
                .await
                .expect("cancelled() did not resolve")
                .unwrap();
        }
    }
}
