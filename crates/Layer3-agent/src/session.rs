//! Chat session - the in-process streaming producer
//!
//! One turn of the loop:
//!
//! ```text
//! provider.stream(messages) ─► Text/Reasoning ──► sink (offset chunks)
//!                           ─► ToolCallDelta ──► accumulator
//!                           ─► Done
//! no calls?  done
//! otherwise: for each call (by index)
//!     step "running" ─► registry.execute ─► step completed/failed + result step
//!     append tool message, then stream again
//! ```

use crate::accumulator::ToolCallAccumulator;
use crate::message::{Message, ToolCall};
use crate::provider::{ChatProvider, StreamEvent};
use crate::tool::{ToolContext, ToolRegistry};
use async_trait::async_trait;
use futures::StreamExt;
use relay_foundation::{AgentConfig, Error, Result};
use relay_task::{ChunkSink, StepStatus, StreamProducer, StreamProtocol, Subtask, ThinkingStep};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What one provider round-trip produced
struct TurnOutput {
    text: String,
    calls: Vec<ToolCall>,
}

pub struct ChatSession {
    provider: Arc<dyn ChatProvider>,
    tools: Arc<ToolRegistry>,
    max_iterations: usize,
    system_prompt: Option<String>,
    protocol: StreamProtocol,
    history: Vec<Message>,
}

impl ChatSession {
    pub fn new(provider: Arc<dyn ChatProvider>, tools: Arc<ToolRegistry>, config: &AgentConfig) -> Self {
        Self {
            provider,
            tools,
            max_iterations: config.max_iterations.max(1),
            system_prompt: config.system_prompt.clone(),
            protocol: StreamProtocol::Current,
            history: Vec::new(),
        }
    }

    pub fn with_max_iterations(mut self, max: usize) -> Self {
        self.max_iterations = max.max(1);
        self
    }

    /// Earlier turns sent ahead of the subtask's prompt
    pub fn with_history(mut self, history: Vec<Message>) -> Self {
        self.history = history;
        self
    }

    /// Cancellation protocol announced to the local stream registry
    pub fn with_protocol(mut self, protocol: StreamProtocol) -> Self {
        self.protocol = protocol;
        self
    }

    async fn stream_turn(&self, messages: &[Message], sink: &mut ChunkSink) -> Result<TurnOutput> {
        let accumulator = ToolCallAccumulator::new();
        let mut text = String::new();
        let mut stream = self.provider.stream(
            messages.to_vec(),
            self.tools.definitions(),
            self.system_prompt.clone(),
        );

        while let Some(event) = stream.next().await {
            sink.check_cancelled()?;
            match event {
                StreamEvent::Text(delta) => {
                    sink.content(&delta).await?;
                    text.push_str(&delta);
                }
                StreamEvent::Reasoning(delta) => {
                    sink.reasoning(&delta).await?;
                }
                StreamEvent::ToolCallDelta {
                    index,
                    id,
                    name,
                    arguments,
                } => {
                    accumulator.add_chunk(index, id.as_deref(), name.as_deref(), &arguments);
                }
                StreamEvent::Done => break,
                StreamEvent::Error(e) => {
                    warn!(subtask_id = %sink.subtask_id(), provider = self.provider.name(), error = %e, "Provider stream failed");
                    return Err(Error::Provider(e));
                }
            }
        }

        Ok(TurnOutput {
            text,
            calls: accumulator.get_calls(),
        })
    }

    /// Run one call with its thinking steps; returns the tool message
    async fn run_call(&self, subtask: &Subtask, call: &ToolCall, sink: &mut ChunkSink) -> Result<Message> {
        sink.check_cancelled()?;
        let run_id = call.id.clone();
        let step_index = sink.next_step_index();
        let step = ThinkingStep::new(format!("Calling {}", call.name), StepStatus::Running)
            .with_tool(&call.name)
            .with_run_id(&run_id)
            .with_details(json!({ "arguments": call.arguments }));
        sink.thinking_step(step_index, step.clone()).await?;

        let ctx = ToolContext {
            task_id: subtask.task_id,
            subtask_id: subtask.id,
            call_id: call.id.clone(),
        };
        // A tool may wait a long time (interactive skills); stopping drops it
        let output = tokio::select! {
            output = self.tools.execute(call, &ctx) => output,
            _ = sink.cancelled() => {
                info!(subtask_id = %subtask.id, tool = %call.name, "Tool call abandoned on cancel");
                return Err(Error::Cancelled);
            }
        };
        let status = if output.is_error {
            StepStatus::Failed
        } else {
            StepStatus::Completed
        };
        debug!(subtask_id = %subtask.id, tool = %call.name, ?status, "Tool finished");

        let mut finished = step;
        finished.status = status;
        sink.thinking_step(step_index, finished).await?;

        let result_index = sink.next_step_index();
        let result = ThinkingStep::new(format!("{} result", call.name), status)
            .with_tool(&call.name)
            .with_run_id(&run_id)
            .with_details(json!({ "output": output.content }));
        sink.thinking_step(result_index, result).await?;

        Ok(Message::tool_result(&call.id, output.content, output.is_error))
    }
}

#[async_trait]
impl StreamProducer for ChatSession {
    async fn run(&self, subtask: Subtask, mut sink: ChunkSink) -> Result<()> {
        let mut messages = self.history.clone();
        messages.push(Message::user(&subtask.prompt));

        for iteration in 1..=self.max_iterations {
            sink.check_cancelled()?;
            debug!(subtask_id = %subtask.id, iteration, "Streaming model turn");

            let turn = self.stream_turn(&messages, &mut sink).await?;
            if turn.calls.is_empty() {
                info!(subtask_id = %subtask.id, iterations = iteration, chars = sink.content_len(), "Chat session finished");
                return Ok(());
            }

            info!(subtask_id = %subtask.id, calls = turn.calls.len(), "Executing tool calls");
            messages.push(Message::assistant_with_tools(turn.text, turn.calls.clone()));
            for call in &turn.calls {
                let message = self.run_call(&subtask, call, &mut sink).await?;
                messages.push(message);
            }
        }

        warn!(subtask_id = %subtask.id, max_iterations = self.max_iterations, "Max iterations reached");
        Ok(())
    }

    fn protocol(&self) -> StreamProtocol {
        self.protocol
    }
}
