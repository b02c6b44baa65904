//! Executors
//!
//! Both execution paths sit behind one [`Executor`] capability:
//! - `LocalExecutor` - in-process streaming producer
//! - `RemoteExecutor` - out-of-process agent reached over `ExecutorRpc`
//!
//! `PtyProcess` is the terminal wrapper remote agents run commands in.

pub mod local;
pub mod pty;
pub mod remote;
pub mod r#trait;

pub use local::{
    CancelSignal, ChunkSink, LocalExecutor, LocalStreamRegistry, StreamLease, StreamProducer,
    StreamProtocol,
};
pub use pty::{PtyCommand, PtyProcess};
pub use r#trait::{CancelAck, Executor};
pub use remote::{ExecutorRpc, HttpExecutorClient, RemoteExecutor};
