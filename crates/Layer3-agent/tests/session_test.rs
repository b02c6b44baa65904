//! Chat session integration tests - scripted provider streams driven through
//! the local executor into an in-memory store.
//!
//! `cargo test -p relay-agent --test session_test`

use async_trait::async_trait;
use futures::stream::BoxStream;
use parking_lot::Mutex;
use relay_agent::{
    ChatProvider, ChatSession, InteractiveTool, Message, MessageRole, StreamEvent, Tool,
    ToolContext, ToolDef, ToolOutput, ToolRegistry,
};
use relay_foundation::{AgentConfig, EventBus, InteractiveConfig, PersistenceConfig};
use relay_task::{
    CancelOutcome, CancellationCoordinator, ExecutionTarget, Executor, InMemoryStore,
    LocalExecutor, LocalStreamRegistry, PendingRequestRegistry, PersistenceBridge, Status,
    StepStatus, StreamProtocol, Subtask, SubtaskRole, Task, TaskStore,
};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// Mocks
// ============================================================================

/// Plays back one scripted event list per model turn
#[derive(Default)]
struct ScriptedProvider {
    turns: Mutex<VecDeque<Vec<StreamEvent>>>,
    /// Messages sent on each call
    requests: Mutex<Vec<Vec<Message>>>,
    /// Events handed to the session so far
    yielded: AtomicUsize,
    /// Replay the last turn forever instead of running dry
    repeat_last: bool,
}

impl ScriptedProvider {
    fn new(turns: Vec<Vec<StreamEvent>>) -> Self {
        Self {
            turns: Mutex::new(turns.into()),
            ..Default::default()
        }
    }

    fn repeating(turn: Vec<StreamEvent>) -> Self {
        Self {
            turns: Mutex::new(vec![turn].into()),
            repeat_last: true,
            ..Default::default()
        }
    }

    fn calls(&self) -> usize {
        self.requests.lock().len()
    }
}

impl ChatProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    fn stream(
        &self,
        messages: Vec<Message>,
        _tools: Vec<ToolDef>,
        _system_prompt: Option<String>,
    ) -> BoxStream<'_, StreamEvent> {
        self.requests.lock().push(messages);
        let events = {
            let mut turns = self.turns.lock();
            if self.repeat_last && turns.len() == 1 {
                turns.front().cloned().unwrap_or_default()
            } else {
                turns.pop_front().unwrap_or_else(|| vec![StreamEvent::Done])
            }
        };
        let yielded = &self.yielded;
        Box::pin(async_stream::stream! {
            for event in events {
                yielded.fetch_add(1, Ordering::SeqCst);
                yield event;
            }
        })
    }
}

/// Streams text forever, one fragment every few milliseconds
struct EndlessProvider;

impl ChatProvider for EndlessProvider {
    fn name(&self) -> &str {
        "endless"
    }

    fn stream(
        &self,
        _messages: Vec<Message>,
        _tools: Vec<ToolDef>,
        _system_prompt: Option<String>,
    ) -> BoxStream<'_, StreamEvent> {
        Box::pin(async_stream::stream! {
            loop {
                yield StreamEvent::text("tick ");
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
    }
}

/// Records every execution and how many provider events preceded it
struct SearchTool {
    provider: Arc<ScriptedProvider>,
    executions: Mutex<Vec<(Value, usize)>>,
}

#[async_trait]
impl Tool for SearchTool {
    fn definition(&self) -> ToolDef {
        ToolDef::new(
            "search",
            "Search the index",
            json!({"type": "object", "properties": {"q": {"type": "string"}}}),
        )
    }

    async fn execute(&self, _ctx: &ToolContext, args: Value) -> ToolOutput {
        let seen = self.provider.yielded.load(Ordering::SeqCst);
        self.executions.lock().push((args.clone(), seen));
        ToolOutput::success(format!("results for {}", args["q"].as_str().unwrap_or("?")))
    }
}

// ============================================================================
// Harness
// ============================================================================

struct Harness {
    store: Arc<InMemoryStore>,
    bridge: Arc<PersistenceBridge>,
    registry: Arc<LocalStreamRegistry>,
}

impl Harness {
    fn new() -> Self {
        let store = Arc::new(InMemoryStore::new());
        let bridge = Arc::new(PersistenceBridge::new(
            store.clone(),
            Arc::new(EventBus::new()),
            &PersistenceConfig::default(),
        ));
        Self {
            store,
            bridge,
            registry: Arc::new(LocalStreamRegistry::new()),
        }
    }

    fn subtask(&self, prompt: &str) -> Subtask {
        let task = self.store.insert_task(Task::new(1)).unwrap();
        self.store
            .insert_subtask(
                Subtask::new(task.id, SubtaskRole::Assistant, 1)
                    .with_prompt(prompt)
                    .with_target(ExecutionTarget::Local),
            )
            .unwrap()
    }

    fn executor(&self, session: ChatSession) -> LocalExecutor {
        LocalExecutor::new(
            Arc::clone(&self.bridge),
            Arc::clone(&self.registry),
            Arc::new(session),
        )
    }

    /// Start, wait for the producer and return the stored row
    async fn run(&self, session: ChatSession, prompt: &str) -> Subtask {
        let executor = self.executor(session);
        let subtask = self.subtask(prompt);
        executor.start(&subtask).await.unwrap();
        executor.join(subtask.id).await;
        self.store.get_subtask(subtask.id).unwrap().unwrap()
    }
}

fn session(provider: Arc<dyn ChatProvider>, tools: ToolRegistry) -> ChatSession {
    ChatSession::new(provider, Arc::new(tools), &AgentConfig::default())
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn test_fragmented_tool_call_runs_once_after_stream_end() {
    let first_turn = vec![
        StreamEvent::text("Let me look. "),
        StreamEvent::tool_start(0, "call_1", "search", ""),
        StreamEvent::tool_args(0, "{\"q\""),
        StreamEvent::tool_args(0, ":\"x\"}"),
        StreamEvent::Done,
    ];
    let first_turn_len = first_turn.len();
    let provider = Arc::new(ScriptedProvider::new(vec![
        first_turn,
        vec![StreamEvent::text("Found it."), StreamEvent::Done],
    ]));
    let search = Arc::new(SearchTool {
        provider: Arc::clone(&provider),
        executions: Mutex::new(Vec::new()),
    });
    let mut tools = ToolRegistry::new();
    tools.register(search.clone());

    let h = Harness::new();
    let stored = h.run(session(provider.clone(), tools), "find x").await;

    // Executed exactly once, only after every event of the turn was consumed
    let executions = search.executions.lock().clone();
    assert_eq!(executions, vec![(json!({"q": "x"}), first_turn_len)]);

    assert_eq!(stored.status, Status::Completed);
    assert_eq!(stored.result.content.as_str(), "Let me look. Found it.");

    // Second model call sees the assistant call and one tool message
    assert_eq!(provider.calls(), 2);
    let second = provider.requests.lock()[1].clone();
    let tool_messages: Vec<_> = second
        .iter()
        .filter(|m| m.role == MessageRole::Tool)
        .collect();
    assert_eq!(tool_messages.len(), 1);
    assert_eq!(tool_messages[0].tool_call_id.as_deref(), Some("call_1"));
    assert_eq!(tool_messages[0].content, "results for x");

    // Invocation step upserted to completed, result step paired by run_id
    assert_eq!(stored.result.thinking.len(), 2);
    let invocation = stored.result.thinking.get(0).unwrap();
    let result = stored.result.thinking.get(1).unwrap();
    assert_eq!(invocation.status, StepStatus::Completed);
    assert_eq!(invocation.tool_name.as_deref(), Some("search"));
    assert_eq!(invocation.run_id, result.run_id);
    assert_eq!(result.details, Some(json!({"output": "results for x"})));
}

#[tokio::test]
async fn test_unknown_tool_reports_not_found_and_continues() {
    let provider = Arc::new(ScriptedProvider::new(vec![
        vec![
            StreamEvent::tool_start(0, "call_9", "teleport", "{}"),
            StreamEvent::Done,
        ],
        vec![StreamEvent::text("I cannot do that."), StreamEvent::Done],
    ]));

    let h = Harness::new();
    let stored = h.run(session(provider.clone(), ToolRegistry::new()), "go").await;

    assert_eq!(stored.status, Status::Completed);
    assert_eq!(stored.result.thinking.get(0).unwrap().status, StepStatus::Failed);
    let second = provider.requests.lock()[1].clone();
    let tool_message = second.iter().find(|m| m.role == MessageRole::Tool).unwrap();
    assert!(tool_message.is_error);
    assert_eq!(tool_message.content, "Tool 'teleport' not found");
}

#[tokio::test]
async fn test_provider_error_fails_subtask_with_message() {
    let provider = Arc::new(ScriptedProvider::new(vec![vec![
        StreamEvent::text("Half an ans"),
        StreamEvent::Error("rate limited".into()),
    ]]));

    let h = Harness::new();
    let stored = h.run(session(provider, ToolRegistry::new()), "hi").await;

    assert_eq!(stored.status, Status::Failed);
    assert!(stored.error_message.unwrap().contains("rate limited"));
    assert_eq!(stored.result.content.as_str(), "Half an ans");
}

#[tokio::test]
async fn test_reasoning_is_kept_apart_from_content() {
    let provider = Arc::new(ScriptedProvider::new(vec![vec![
        StreamEvent::Reasoning("thinking about ".into()),
        StreamEvent::Reasoning("it".into()),
        StreamEvent::text("answer"),
        StreamEvent::Done,
    ]]));

    let h = Harness::new();
    let stored = h.run(session(provider, ToolRegistry::new()), "q").await;

    assert_eq!(stored.result.reasoning.as_str(), "thinking about it");
    assert_eq!(stored.result.content.as_str(), "answer");
}

#[tokio::test]
async fn test_tool_loop_stops_at_max_iterations() {
    let provider = Arc::new(ScriptedProvider::repeating(vec![
        StreamEvent::tool_start(0, "call_0", "teleport", "{}"),
        StreamEvent::Done,
    ]));
    let session = session(provider.clone(), ToolRegistry::new()).with_max_iterations(3);

    let h = Harness::new();
    let stored = h.run(session, "loop").await;

    assert_eq!(provider.calls(), 3);
    assert_eq!(stored.status, Status::Completed);
}

#[tokio::test]
async fn test_cancel_stops_session_mid_stream() {
    let h = Harness::new();
    let executor = Arc::new(h.executor(
        session(Arc::new(EndlessProvider), ToolRegistry::new()).with_protocol(StreamProtocol::Legacy),
    ));
    let subtask = h.subtask("talk forever");
    executor.start(&subtask).await.unwrap();

    // Let some output land first
    for _ in 0..200 {
        let row = h.store.get_subtask(subtask.id).unwrap().unwrap();
        if !row.result.content.as_str().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let coordinator =
        CancellationCoordinator::new(Arc::clone(&h.bridge)).with_local_executor(executor.clone());
    let outcome = coordinator.cancel(subtask.id).await.unwrap();
    assert!(matches!(
        outcome,
        CancelOutcome::Cancelled {
            stopped_stream: Some(StreamProtocol::Legacy),
            ..
        }
    ));

    tokio::time::timeout(Duration::from_secs(5), executor.join(subtask.id))
        .await
        .expect("session did not stop after cancel");
    let stored = h.store.get_subtask(subtask.id).unwrap().unwrap();
    assert_eq!(stored.status, Status::Cancelled);
    assert!(stored.result.content.as_str().starts_with("tick "));
}

#[tokio::test]
async fn test_cancel_while_waiting_on_interactive_tool() {
    let pending = Arc::new(PendingRequestRegistry::new(&InteractiveConfig::default()));
    let mut tools = ToolRegistry::new();
    tools.register(Arc::new(InteractiveTool::new(
        Arc::clone(&pending),
        "confirm_deploy",
        "confirm",
    )));
    let provider = Arc::new(ScriptedProvider::new(vec![vec![
        StreamEvent::tool_start(0, "call_1", "confirm_deploy", "{\"env\":\"prod\"}"),
        StreamEvent::Done,
    ]]));

    let h = Harness::new();
    let executor = Arc::new(h.executor(session(provider, tools)));
    let subtask = h.subtask("deploy it");
    executor.start(&subtask).await.unwrap();

    let request_id = format!("{}:call_1", subtask.id);
    for _ in 0..200 {
        if pending.is_pending(&request_id) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(pending.is_pending(&request_id));

    let coordinator =
        CancellationCoordinator::new(Arc::clone(&h.bridge)).with_local_executor(executor.clone());
    let outcome = coordinator.cancel(subtask.id).await.unwrap();
    assert!(matches!(outcome, CancelOutcome::Cancelled { .. }));

    tokio::time::timeout(Duration::from_secs(5), executor.join(subtask.id))
        .await
        .expect("session kept waiting on the interactive answer");
    assert_eq!(pending.pending_count(), 0);
    let stored = h.store.get_subtask(subtask.id).unwrap().unwrap();
    assert_eq!(stored.status, Status::Cancelled);
}
