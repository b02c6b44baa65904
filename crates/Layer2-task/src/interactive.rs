//! Pending interactive requests
//!
//! A skill that needs a human round-trip registers a request and waits on
//! the returned handle. The answer arrives through `resolve`; a background
//! sweep completes overdue requests with a timeout error. Every request is
//! completed exactly once.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use relay_foundation::event::interactive as interactive_events;
use relay_foundation::{EventBus, InteractiveConfig};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum InteractiveError {
    #[error("request {0} is already pending")]
    DuplicateId(String),

    #[error("request {0} is not pending")]
    NotPending(String),

    #[error("request {0} was already resolved")]
    AlreadyResolved(String),

    #[error("request {id} timed out after {timeout:?}")]
    Timeout { id: String, timeout: Duration },

    #[error("{0}")]
    Resolver(String),

    #[error("request {0} was dropped without an answer")]
    Dropped(String),
}

impl From<InteractiveError> for relay_foundation::Error {
    fn from(e: InteractiveError) -> Self {
        match e {
            InteractiveError::Timeout { .. } => relay_foundation::Error::Timeout(e.to_string()),
            InteractiveError::NotPending(_) => relay_foundation::Error::NotFound(e.to_string()),
            other => relay_foundation::Error::InvalidInput(other.to_string()),
        }
    }
}

pub type InteractiveResult = std::result::Result<Value, InteractiveError>;

struct Pending {
    skill: String,
    action: String,
    payload: Value,
    created_at: DateTime<Utc>,
    started: Instant,
    timeout: Duration,
    tx: oneshot::Sender<InteractiveResult>,
}

/// Snapshot of a pending request
#[derive(Debug, Clone, PartialEq)]
pub struct PendingRequestInfo {
    pub id: String,
    pub skill: String,
    pub action: String,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
    pub timeout: Duration,
}

/// Waitable side of a registered request
#[derive(Debug)]
pub struct PendingHandle {
    id: String,
    rx: oneshot::Receiver<InteractiveResult>,
}

impl PendingHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn wait(self) -> InteractiveResult {
        self.rx
            .await
            .unwrap_or_else(|_| Err(InteractiveError::Dropped(self.id)))
    }
}

#[derive(Default)]
struct Inner {
    pending: HashMap<String, Pending>,
    /// Recently finished ids, kept to tell "already resolved" from "unknown"
    finished: HashMap<String, Instant>,
}

pub struct PendingRequestRegistry {
    inner: Mutex<Inner>,
    default_timeout: Duration,
    finished_retention: Duration,
    events: Option<Arc<EventBus>>,
}

impl PendingRequestRegistry {
    pub fn new(config: &InteractiveConfig) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            default_timeout: config.default_timeout(),
            finished_retention: config.resolved_retention(),
            events: None,
        }
    }

    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    pub fn register(
        &self,
        id: impl Into<String>,
        skill: impl Into<String>,
        action: impl Into<String>,
        payload: Value,
        timeout: Option<Duration>,
    ) -> std::result::Result<PendingHandle, InteractiveError> {
        let id = id.into();
        let (tx, rx) = oneshot::channel();
        let pending = Pending {
            skill: skill.into(),
            action: action.into(),
            payload,
            created_at: Utc::now(),
            started: Instant::now(),
            timeout: timeout.unwrap_or(self.default_timeout),
            tx,
        };

        let mut inner = self.inner.lock();
        if inner.pending.contains_key(&id) {
            return Err(InteractiveError::DuplicateId(id));
        }
        debug!(request_id = %id, skill = %pending.skill, action = %pending.action, timeout = ?pending.timeout, "Registered interactive request");
        inner.finished.remove(&id);
        inner.pending.insert(id.clone(), pending);
        Ok(PendingHandle { id, rx })
    }

    /// Complete a request once; `error` turns the answer into a failure
    pub fn resolve(
        &self,
        id: &str,
        result: Value,
        error: Option<String>,
    ) -> std::result::Result<(), InteractiveError> {
        let pending = {
            let mut inner = self.inner.lock();
            match inner.pending.remove(id) {
                Some(pending) => {
                    inner.finished.insert(id.to_string(), Instant::now());
                    pending
                }
                None if inner.finished.contains_key(id) => {
                    warn!(request_id = %id, "Interactive request resolved twice");
                    return Err(InteractiveError::AlreadyResolved(id.to_string()));
                }
                None => {
                    warn!(request_id = %id, "Resolve for unknown interactive request");
                    return Err(InteractiveError::NotPending(id.to_string()));
                }
            }
        };

        let outcome = match error {
            Some(message) => Err(InteractiveError::Resolver(message)),
            None => Ok(result),
        };
        if pending.tx.send(outcome).is_err() {
            debug!(request_id = %id, "Interactive waiter already gone");
        }
        info!(request_id = %id, skill = %pending.skill, "Interactive request resolved");
        Ok(())
    }

    /// Drop a pending request whose caller stopped waiting. Nothing is sent;
    /// a later resolve reports `NotPending`.
    pub fn withdraw(&self, id: &str) -> bool {
        let withdrawn = self.inner.lock().pending.remove(id);
        match withdrawn {
            Some(pending) => {
                info!(request_id = %id, skill = %pending.skill, "Interactive request withdrawn");
                true
            }
            None => false,
        }
    }

    /// Expire overdue requests as of `now`; returns `(id, skill)` of each
    pub fn sweep_at(&self, now: Instant) -> Vec<(String, String)> {
        let expired: Vec<(String, Pending)> = {
            let mut inner = self.inner.lock();
            let overdue: Vec<String> = inner
                .pending
                .iter()
                .filter(|(_, p)| now.saturating_duration_since(p.started) >= p.timeout)
                .map(|(id, _)| id.clone())
                .collect();

            let expired: Vec<(String, Pending)> = overdue
                .into_iter()
                .filter_map(|id| inner.pending.remove(&id).map(|p| (id, p)))
                .collect();
            for (id, _) in &expired {
                inner.finished.insert(id.clone(), now);
            }

            let retention = self.finished_retention;
            inner
                .finished
                .retain(|_, at| now.saturating_duration_since(*at) < retention);
            expired
        };

        expired
            .into_iter()
            .map(|(id, pending)| {
                warn!(request_id = %id, skill = %pending.skill, timeout = ?pending.timeout, "Interactive request expired");
                let _ = pending.tx.send(Err(InteractiveError::Timeout {
                    id: id.clone(),
                    timeout: pending.timeout,
                }));
                (id, pending.skill)
            })
            .collect()
    }

    /// Sweep now and publish an event per expired request
    pub async fn sweep_expired(&self) -> usize {
        let expired = self.sweep_at(Instant::now());
        if let Some(events) = &self.events {
            for (id, skill) in &expired {
                events.publish(interactive_events::expired(id, skill)).await;
            }
        }
        expired.len()
    }

    /// Sweep every `interval` until `shutdown` fires
    pub fn spawn_sweeper(
        self: Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let expired = self.sweep_expired().await;
                        if expired > 0 {
                            debug!(expired, "Interactive sweep expired requests");
                        }
                    }
                }
            }
            debug!("Interactive sweeper stopped");
        })
    }

    pub fn is_pending(&self, id: &str) -> bool {
        self.inner.lock().pending.contains_key(id)
    }

    pub fn pending_count(&self) -> usize {
        self.inner.lock().pending.len()
    }

    pub fn list(&self) -> Vec<PendingRequestInfo> {
        let inner = self.inner.lock();
        let mut list: Vec<PendingRequestInfo> = inner
            .pending
            .iter()
            .map(|(id, p)| PendingRequestInfo {
                id: id.clone(),
                skill: p.skill.clone(),
                action: p.action.clone(),
                payload: p.payload.clone(),
                created_at: p.created_at,
                timeout: p.timeout,
            })
            .collect();
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        list
    }
}
