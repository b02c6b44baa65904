//! Event Bus - publish/subscribe with isolated handler failures
//!
//! Every handler invocation is wrapped on its own: an error or a panic in one
//! handler is captured into the [`DispatchReport`] and never reaches the
//! publisher or the other handlers.

use super::types::{EventCategory, EventSeverity, RelayEvent};
use crate::Result;
use async_trait::async_trait;
use futures::FutureExt;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, trace, warn};

// ============================================================================
// EventHandler
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

impl std::fmt::Display for HandlerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "handler-{}", self.0)
    }
}

/// Fire-and-forget event handler
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handler name (diagnostics only)
    fn name(&self) -> &str;

    async fn handle(&self, event: &RelayEvent) -> Result<()>;
}

// ============================================================================
// EventFilter
// ============================================================================

/// Selects which events reach a handler
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub categories: Option<Vec<EventCategory>>,

    /// Event type prefixes, e.g. `"subtask."`
    pub event_types: Option<Vec<String>>,

    pub min_severity: Option<EventSeverity>,
}

impl EventFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_categories(mut self, categories: Vec<EventCategory>) -> Self {
        self.categories = Some(categories);
        self
    }

    pub fn with_event_types(mut self, types: Vec<String>) -> Self {
        self.event_types = Some(types);
        self
    }

    pub fn with_min_severity(mut self, severity: EventSeverity) -> Self {
        self.min_severity = Some(severity);
        self
    }

    pub fn matches(&self, event: &RelayEvent) -> bool {
        if let Some(ref cats) = self.categories {
            if !cats.contains(&event.category) {
                return false;
            }
        }

        if let Some(ref types) = self.event_types {
            if !types.iter().any(|t| event.event_type.starts_with(t)) {
                return false;
            }
        }

        if let Some(min) = self.min_severity {
            if event.severity < min {
                return false;
            }
        }

        true
    }
}

// ============================================================================
// Dispatch report
// ============================================================================

/// A single handler failure captured during dispatch
#[derive(Debug, Clone)]
pub struct HandlerFailure {
    pub handler: String,
    pub error: String,
    pub panicked: bool,
}

/// Outcome of one `publish` call
#[derive(Debug, Clone, Default)]
pub struct DispatchReport {
    pub delivered: usize,
    pub failures: Vec<HandlerFailure>,
}

impl DispatchReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

// ============================================================================
// EventBus
// ============================================================================

#[derive(Debug, Clone)]
pub struct EventBusConfig {
    /// Broadcast channel capacity for stream-style receivers
    pub channel_capacity: usize,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1024,
        }
    }
}

struct RegisteredHandler {
    handler: Arc<dyn EventHandler>,
    filter: EventFilter,
}

/// Event bus shared by the bridge, coordinator, reaper and registry.
///
/// Constructed explicitly and passed around as `Arc<EventBus>`; each test
/// builds its own.
pub struct EventBus {
    sender: broadcast::Sender<RelayEvent>,
    handlers: RwLock<HashMap<HandlerId, RegisteredHandler>>,
    next_id: AtomicU64,
    published: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_config(EventBusConfig::default())
    }

    pub fn with_config(config: EventBusConfig) -> Self {
        let (sender, _) = broadcast::channel(config.channel_capacity);
        Self {
            sender,
            handlers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            published: AtomicU64::new(0),
        }
    }

    /// Register a handler receiving every event
    pub async fn subscribe(&self, handler: Arc<dyn EventHandler>) -> HandlerId {
        self.subscribe_with_filter(handler, EventFilter::default())
            .await
    }

    pub async fn subscribe_with_filter(
        &self,
        handler: Arc<dyn EventHandler>,
        filter: EventFilter,
    ) -> HandlerId {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::SeqCst));
        debug!(handler = handler.name(), handler_id = %id, "Registering event handler");
        self.handlers
            .write()
            .await
            .insert(id, RegisteredHandler { handler, filter });
        id
    }

    pub async fn unsubscribe(&self, id: HandlerId) -> bool {
        self.handlers.write().await.remove(&id).is_some()
    }

    /// Publish an event to all matching handlers
    pub async fn publish(&self, event: RelayEvent) -> DispatchReport {
        self.published.fetch_add(1, Ordering::SeqCst);
        let _ = self.sender.send(event.clone());

        // Snapshot matching handlers so no lock is held while they run
        let targets: Vec<Arc<dyn EventHandler>> = {
            let handlers = self.handlers.read().await;
            handlers
                .values()
                .filter(|h| h.filter.matches(&event))
                .map(|h| Arc::clone(&h.handler))
                .collect()
        };

        let mut report = DispatchReport::default();
        for handler in targets {
            trace!(handler = handler.name(), event_type = %event.event_type, "Delivering event");

            let outcome = AssertUnwindSafe(handler.handle(&event))
                .catch_unwind()
                .await;

            match outcome {
                Ok(Ok(())) => report.delivered += 1,
                Ok(Err(e)) => {
                    warn!(handler = handler.name(), event_type = %event.event_type, error = %e, "Event handler failed");
                    report.failures.push(HandlerFailure {
                        handler: handler.name().to_string(),
                        error: e.to_string(),
                        panicked: false,
                    });
                }
                Err(panic) => {
                    let message = panic_message(panic.as_ref());
                    warn!(handler = handler.name(), event_type = %event.event_type, panic = %message, "Event handler panicked");
                    report.failures.push(HandlerFailure {
                        handler: handler.name().to_string(),
                        error: message,
                        panicked: true,
                    });
                }
            }
        }

        report
    }

    /// Stream-style receiver of every published event
    pub fn receiver(&self) -> broadcast::Receiver<RelayEvent> {
        self.sender.subscribe()
    }

    pub async fn handler_count(&self) -> usize {
        self.handlers.read().await.len()
    }

    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::SeqCst)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}
