//! Tools and the registry that executes accumulated calls

use crate::message::ToolCall;
use crate::provider::ToolDef;
use async_trait::async_trait;
use relay_task::{SubtaskId, TaskId};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Where a call is running
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub task_id: TaskId,
    pub subtask_id: SubtaskId,
    pub call_id: String,
}

/// String outcome of a tool
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutput {
    pub content: String,
    pub is_error: bool,
}

impl ToolOutput {
    pub fn success(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: true,
        }
    }
}

/// A callable tool. Failures are reported in the output, never raised.
#[async_trait]
pub trait Tool: Send + Sync {
    fn definition(&self) -> ToolDef;

    fn name(&self) -> String {
        self.definition().name
    }

    async fn execute(&self, ctx: &ToolContext, args: Value) -> ToolOutput;
}

/// Registry of available tools
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name();
        self.tools.insert(name, tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// All tool definitions, sorted by name
    pub fn definitions(&self) -> Vec<ToolDef> {
        let mut defs: Vec<ToolDef> = self.tools.values().map(|t| t.definition()).collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Execute an accumulated call.
    ///
    /// Unparseable arguments run the tool with `{}`; an unknown tool yields
    /// a not-found error output.
    pub async fn execute(&self, call: &ToolCall, ctx: &ToolContext) -> ToolOutput {
        let Some(tool) = self.get(&call.name) else {
            warn!(tool = %call.name, call_id = %call.id, "Model called an unknown tool");
            return ToolOutput::error(format!("Tool '{}' not found", call.name));
        };

        let args = parse_arguments(call);
        debug!(tool = %call.name, call_id = %call.id, "Executing tool");
        tool.execute(ctx, args).await
    }
}

fn parse_arguments(call: &ToolCall) -> Value {
    let raw = call.arguments.trim();
    if raw.is_empty() {
        return Value::Object(Default::default());
    }
    match serde_json::from_str::<Value>(raw) {
        Ok(args) => args,
        Err(e) => {
            warn!(
                tool = %call.name,
                call_id = %call.id,
                error = %e,
                "Malformed tool arguments, executing with {{}}"
            );
            Value::Object(Default::default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn definition(&self) -> ToolDef {
            ToolDef::new("echo", "Echo the arguments", json!({"type": "object"}))
        }

        async fn execute(&self, _ctx: &ToolContext, args: Value) -> ToolOutput {
            ToolOutput::success(args.to_string())
        }
    }

    fn ctx() -> ToolContext {
        ToolContext {
            task_id: TaskId(1),
            subtask_id: SubtaskId(2),
            call_id: "call_0".into(),
        }
    }

    fn call(name: &str, arguments: &str) -> ToolCall {
        ToolCall {
            index: 0,
            id: "call_0".into(),
            name: name.into(),
            arguments: arguments.into(),
        }
    }

    fn registry() -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool));
        registry
    }

    #[tokio::test]
    async fn test_execute_parses_arguments() {
        let out = registry().execute(&call("echo", r#"{"a":1}"#), &ctx()).await;
        assert_eq!(out, ToolOutput::success(r#"{"a":1}"#));
    }

    #[tokio::test]
    async fn test_malformed_arguments_become_empty_object() {
        let out = registry().execute(&call("echo", r#"{"a":"#), &ctx()).await;
        assert_eq!(out, ToolOutput::success("{}"));
    }

    #[tokio::test]
    async fn test_unknown_tool_is_reported() {
        let out = registry().execute(&call("nope", "{}"), &ctx()).await;
        assert!(out.is_error);
        assert_eq!(out.content, "Tool 'nope' not found");
    }
}
