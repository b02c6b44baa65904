//! Interactive tool - a skill that waits for a human answer
//!
//! Each call registers a pending request keyed by `{subtask}:{call}` and
//! blocks the session until the request is resolved or expires. A call that
//! is dropped while waiting withdraws its request.

use crate::provider::ToolDef;
use crate::tool::{Tool, ToolContext, ToolOutput};
use async_trait::async_trait;
use relay_task::{InteractiveError, PendingRequestRegistry};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Withdraws the request if the waiting call is dropped before an answer
struct PendingGuard<'a> {
    registry: &'a PendingRequestRegistry,
    id: &'a str,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.registry.withdraw(self.id) {
            debug!(request_id = %self.id, "Interactive call abandoned");
        }
    }
}

pub struct InteractiveTool {
    registry: Arc<PendingRequestRegistry>,
    skill: String,
    action: String,
    description: String,
    parameters: Value,
    timeout: Option<Duration>,
}

impl InteractiveTool {
    pub fn new(
        registry: Arc<PendingRequestRegistry>,
        skill: impl Into<String>,
        action: impl Into<String>,
    ) -> Self {
        let skill = skill.into();
        Self {
            registry,
            description: format!("Ask the user through the {} skill", skill),
            skill,
            action: action.into(),
            parameters: json!({ "type": "object" }),
            timeout: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// JSON Schema the model fills in as the request payload
    pub fn with_parameters(mut self, parameters: Value) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn request_id(ctx: &ToolContext) -> String {
        format!("{}:{}", ctx.subtask_id, ctx.call_id)
    }
}

#[async_trait]
impl Tool for InteractiveTool {
    fn definition(&self) -> ToolDef {
        ToolDef::new(&self.skill, &self.description, self.parameters.clone())
    }

    async fn execute(&self, ctx: &ToolContext, args: Value) -> ToolOutput {
        let id = Self::request_id(ctx);
        let handle = match self
            .registry
            .register(&id, &self.skill, &self.action, args, self.timeout)
        {
            Ok(handle) => handle,
            Err(e) => return ToolOutput::error(e.to_string()),
        };
        info!(request_id = %id, skill = %self.skill, "Waiting for interactive answer");
        let _guard = PendingGuard {
            registry: &self.registry,
            id: &id,
        };

        match handle.wait().await {
            Ok(Value::String(answer)) => ToolOutput::success(answer),
            Ok(answer) => ToolOutput::success(answer.to_string()),
            Err(e @ InteractiveError::Timeout { .. }) => {
                warn!(request_id = %id, skill = %self.skill, "Interactive request timed out");
                ToolOutput::error(e.to_string())
            }
            Err(e) => ToolOutput::error(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_foundation::InteractiveConfig;
    use relay_task::{SubtaskId, TaskId};

    fn ctx() -> ToolContext {
        ToolContext {
            task_id: TaskId(1),
            subtask_id: SubtaskId(5),
            call_id: "call_0".into(),
        }
    }

    #[tokio::test]
    async fn test_answer_becomes_tool_output() {
        let registry = Arc::new(PendingRequestRegistry::new(&InteractiveConfig::default()));
        let tool = InteractiveTool::new(Arc::clone(&registry), "confirm_deploy", "confirm");

        let resolver = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move {
                while !registry.is_pending("5:call_0") {
                    tokio::task::yield_now().await;
                }
                registry.resolve("5:call_0", json!("yes"), None).unwrap();
            })
        };

        let out = tool.execute(&ctx(), json!({"env": "prod"})).await;
        resolver.await.unwrap();
        assert_eq!(out, ToolOutput::success("yes"));
    }

    #[tokio::test]
    async fn test_expired_request_is_error_output() {
        let registry = Arc::new(PendingRequestRegistry::new(&InteractiveConfig::default()));
        let tool = InteractiveTool::new(Arc::clone(&registry), "confirm_deploy", "confirm")
            .with_timeout(Duration::from_millis(1));

        let sweeper = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move {
                while !registry.is_pending("5:call_0") {
                    tokio::task::yield_now().await;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
                registry.sweep_expired().await;
            })
        };

        let out = tool.execute(&ctx(), Value::Null).await;
        sweeper.await.unwrap();
        assert!(out.is_error);
        assert!(out.content.contains("timed out"));
    }

    #[tokio::test]
    async fn test_dropped_call_withdraws_request() {
        let registry = Arc::new(PendingRequestRegistry::new(&InteractiveConfig::default()));
        let tool = InteractiveTool::new(Arc::clone(&registry), "confirm_deploy", "confirm");

        let waited =
            tokio::time::timeout(Duration::from_millis(20), tool.execute(&ctx(), json!({}))).await;
        assert!(waited.is_err());
        assert_eq!(registry.pending_count(), 0);
    }
}
