//! Stale executor reaper
//!
//! On a fixed interval, finds remote agents whose subtask and task are both
//! terminal and untouched for longer than the retention window, and deletes
//! each agent once. Retention can be overridden per task type.

use crate::bridge::PersistenceBridge;
use crate::executor::ExecutorRpc;
use crate::store::ReclaimFilter;
use crate::task::{ExecutorHandle, SubtaskId};
use chrono::{DateTime, Utc};
use relay_foundation::event::executor as executor_events;
use relay_foundation::{Error, ReaperConfig, Result};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// What one sweep did
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReapReport {
    /// Rows returned by the coarse store scan
    pub scanned: usize,
    /// Rows past their task type's retention window
    pub eligible: usize,
    /// Executors deleted and the number of subtasks marked for each
    pub reclaimed: Vec<(ExecutorHandle, usize)>,
    /// Executors whose delete failed; retried next sweep
    pub failed: Vec<(ExecutorHandle, String)>,
}

impl ReapReport {
    pub fn is_empty(&self) -> bool {
        self.reclaimed.is_empty() && self.failed.is_empty()
    }
}

fn chrono_duration(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(365 * 100))
}

pub struct StaleExecutorReaper {
    bridge: Arc<PersistenceBridge>,
    rpc: Arc<dyn ExecutorRpc>,
    config: ReaperConfig,
    delete_timeout: Duration,
}

impl StaleExecutorReaper {
    pub fn new(
        bridge: Arc<PersistenceBridge>,
        rpc: Arc<dyn ExecutorRpc>,
        config: ReaperConfig,
        delete_timeout: Duration,
    ) -> Self {
        Self {
            bridge,
            rpc,
            config,
            delete_timeout,
        }
    }

    /// Group eligible subtasks by executor, applying per-task-type retention
    async fn collect(&self, now: DateTime<Utc>) -> Result<(usize, BTreeMap<ExecutorHandle, Vec<SubtaskId>>)> {
        let filter = ReclaimFilter::terminal_before(now - chrono_duration(self.config.min_retention()));
        let store = self.bridge.store();
        let candidates = self
            .bridge
            .pool()
            .run(move || store.scan_reclaimable(&filter))
            .await?;
        let scanned = candidates.len();

        let mut by_executor: BTreeMap<ExecutorHandle, Vec<SubtaskId>> = BTreeMap::new();
        for candidate in candidates {
            let retention = self.config.retention_for(candidate.task_type.as_deref());
            let cutoff = now - chrono_duration(retention);
            if candidate.last_touched() >= cutoff {
                debug!(
                    subtask_id = %candidate.subtask_id,
                    task_type = ?candidate.task_type,
                    ?retention,
                    "Executor still inside retention window"
                );
                continue;
            }
            by_executor
                .entry(candidate.executor)
                .or_default()
                .push(candidate.subtask_id);
        }
        Ok((scanned, by_executor))
    }

    /// One pass over the store
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> Result<ReapReport> {
        let (scanned, by_executor) = self.collect(now).await?;
        let mut report = ReapReport {
            scanned,
            eligible: by_executor.values().map(Vec::len).sum(),
            ..Default::default()
        };

        for (executor, subtasks) in by_executor {
            let deleted = tokio::time::timeout(self.delete_timeout, self.rpc.delete_executor(&executor))
                .await
                .unwrap_or_else(|_| {
                    Err(Error::Timeout(format!(
                        "delete of {} after {:?}",
                        executor, self.delete_timeout
                    )))
                });

            match deleted {
                Ok(()) => {
                    let store = self.bridge.store();
                    let handle = executor.clone();
                    let marked = self
                        .bridge
                        .pool()
                        .run(move || store.mark_executor_reclaimed(&handle, now))
                        .await?;
                    info!(executor = %executor, subtasks = marked, "Reclaimed stale executor");
                    self.bridge
                        .events()
                        .publish(executor_events::reclaimed(&executor.namespace, &executor.name, marked))
                        .await;
                    report.reclaimed.push((executor, marked));
                }
                Err(e) => {
                    warn!(
                        executor = %executor,
                        subtasks = ?subtasks,
                        error = %e,
                        "Executor delete failed; will retry next sweep"
                    );
                    let message = e.to_string();
                    self.bridge
                        .events()
                        .publish(executor_events::reclaim_failed(
                            &executor.namespace,
                            &executor.name,
                            &message,
                        ))
                        .await;
                    report.failed.push((executor, message));
                }
            }
        }

        Ok(report)
    }

    /// Run sweeps every `interval` until `shutdown` fires
    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            if !self.config.enabled {
                info!("Executor reaper disabled");
                return;
            }

            let mut ticker = tokio::time::interval(self.config.interval());
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            info!(interval = ?self.config.interval(), "Executor reaper started");

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        match self.sweep_once(Utc::now()).await {
                            Ok(report) if report.is_empty() => debug!(scanned = report.scanned, "Reaper sweep found nothing"),
                            Ok(report) => info!(
                                reclaimed = report.reclaimed.len(),
                                failed = report.failed.len(),
                                "Reaper sweep finished"
                            ),
                            Err(e) => error!(error = %e, "Reaper sweep failed"),
                        }
                    }
                }
            }
            info!("Executor reaper stopped");
        })
    }
}
