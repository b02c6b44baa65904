//! # relay-agent
//!
//! In-process streaming producer for Relay: a chat session that streams a
//! model's output into a subtask and runs the tools it calls.
//!
//! ## Flow
//!
//! ```text
//! LocalExecutor ─► ChatSession::run(subtask, sink)
//!                      │
//!                      ├─► ChatProvider::stream  (text, reasoning, tool fragments)
//!                      ├─► ToolCallAccumulator   (fragments → calls at turn end)
//!                      └─► ToolRegistry::execute (one tool message per call)
//! ```

pub mod accumulator;
pub mod interactive;
pub mod message;
pub mod provider;
pub mod session;
pub mod tool;

pub use accumulator::ToolCallAccumulator;
pub use interactive::InteractiveTool;
pub use message::{Message, MessageRole, ToolCall};
pub use provider::{ChatProvider, StreamEvent, ToolDef};
pub use session::ChatSession;
pub use tool::{Tool, ToolContext, ToolOutput, ToolRegistry};
