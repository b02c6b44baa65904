//! LLM provider seam
//!
//! The session consumes a provider as an opaque stream of events; wire
//! formats live behind implementations of [`ChatProvider`].

use crate::message::Message;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Events emitted during streaming
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// Text content delta
    Text(String),

    /// Reasoning content (for models that expose it)
    Reasoning(String),

    /// Fragment of a tool call, keyed by its zero-based index
    ToolCallDelta {
        index: usize,
        id: Option<String>,
        name: Option<String>,
        arguments: String,
    },

    /// The model finished its turn
    Done,

    /// Terminal provider error
    Error(String),
}

impl StreamEvent {
    pub fn text(s: impl Into<String>) -> Self {
        StreamEvent::Text(s.into())
    }

    /// First fragment of a call: id and name, possibly some arguments
    pub fn tool_start(
        index: usize,
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: impl Into<String>,
    ) -> Self {
        StreamEvent::ToolCallDelta {
            index,
            id: Some(id.into()),
            name: Some(name.into()),
            arguments: arguments.into(),
        }
    }

    /// Later fragment carrying only arguments
    pub fn tool_args(index: usize, arguments: impl Into<String>) -> Self {
        StreamEvent::ToolCallDelta {
            index,
            id: None,
            name: None,
            arguments: arguments.into(),
        }
    }
}

/// Definition of a tool for LLM function calling
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDef {
    pub name: String,
    pub description: String,
    /// JSON Schema for parameters
    pub parameters: Value,
}

impl ToolDef {
    pub fn new(name: impl Into<String>, description: impl Into<String>, parameters: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
        }
    }
}

/// Streaming chat model
pub trait ChatProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Send messages and get a streaming response
    fn stream(
        &self,
        messages: Vec<Message>,
        tools: Vec<ToolDef>,
        system_prompt: Option<String>,
    ) -> BoxStream<'_, StreamEvent>;
}
