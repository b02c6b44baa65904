//! Remote executor - out-of-process agents behind the executor manager
//!
//! ```text
//! POST {base}/executor-manager/tasks/receive     dispatch a subtask
//! POST {base}/executor-manager/tasks/cancel      stop a task's agent work
//! POST {base}/executor-manager/executor/delete   reclaim an agent
//! ```

use crate::bridge::PersistenceBridge;
use crate::chunk::{Chunk, ChunkPayload};
use crate::executor::{CancelAck, Executor};
use crate::task::{ExecutionTarget, ExecutorHandle, Subtask, TaskId};
use async_trait::async_trait;
use relay_foundation::{Error, RemoteConfig, Result};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Calls into the remote executor manager
#[async_trait]
pub trait ExecutorRpc: Send + Sync {
    /// Hand a subtask to an agent; returns the agent if one was assigned
    async fn dispatch(&self, subtask: &Subtask) -> Result<Option<ExecutorHandle>>;

    async fn cancel(&self, task_id: TaskId) -> Result<()>;

    async fn delete_executor(&self, executor: &ExecutorHandle) -> Result<()>;
}

#[derive(Serialize)]
struct DispatchRequest<'a> {
    task_id: TaskId,
    subtask_id: i64,
    prompt: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    executor_name: Option<&'a str>,
    executor_namespace: &'a str,
}

#[derive(Deserialize, Default)]
struct DispatchResponse {
    #[serde(default)]
    executor_name: Option<String>,
    #[serde(default)]
    executor_namespace: Option<String>,
}

#[derive(Serialize)]
struct CancelRequest {
    task_id: TaskId,
}

#[derive(Serialize)]
struct DeleteRequest<'a> {
    executor_name: &'a str,
    executor_namespace: &'a str,
}

/// HTTP client for the executor manager
pub struct HttpExecutorClient {
    client: Client,
    base_url: String,
    dispatch_timeout: Duration,
    cancel_timeout: Duration,
    delete_timeout: Duration,
}

impl HttpExecutorClient {
    pub fn new(config: &RemoteConfig) -> Result<Self> {
        let client = Client::builder()
            .build()
            .map_err(|e| Error::Http(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            dispatch_timeout: config.dispatch_timeout(),
            cancel_timeout: config.cancel_timeout(),
            delete_timeout: config.delete_timeout(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn post<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
        timeout: Duration,
    ) -> Result<String> {
        let url = format!("{}/executor-manager/{}", self.base_url, path);
        debug!(%url, ?timeout, "Calling executor manager");

        let response = self
            .client
            .post(&url)
            .json(body)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| map_reqwest(path, e))?;

        let status = response.status();
        let text = response.text().await.map_err(|e| map_reqwest(path, e))?;
        if !status.is_success() {
            return Err(Error::Executor(format!("{} returned {}: {}", path, status, text)));
        }
        Ok(text)
    }
}

fn map_reqwest(path: &str, e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::Timeout(format!("{}: {}", path, e))
    } else {
        Error::Http(format!("{}: {}", path, e))
    }
}

#[async_trait]
impl ExecutorRpc for HttpExecutorClient {
    async fn dispatch(&self, subtask: &Subtask) -> Result<Option<ExecutorHandle>> {
        let (name, namespace) = match &subtask.target {
            ExecutionTarget::Remote {
                executor_name,
                executor_namespace,
            } => (
                Some(executor_name.as_str()).filter(|n| !n.is_empty()),
                executor_namespace.as_str(),
            ),
            ExecutionTarget::Local => {
                return Err(Error::InvalidInput(format!(
                    "subtask {} is not a remote subtask",
                    subtask.id
                )))
            }
        };

        let body = self
            .post(
                "tasks/receive",
                &DispatchRequest {
                    task_id: subtask.task_id,
                    subtask_id: subtask.id.0,
                    prompt: &subtask.prompt,
                    executor_name: name,
                    executor_namespace: namespace,
                },
                self.dispatch_timeout,
            )
            .await?;

        let response: DispatchResponse = if body.trim().is_empty() {
            DispatchResponse::default()
        } else {
            serde_json::from_str(&body)?
        };

        Ok(response
            .executor_name
            .filter(|n| !n.is_empty())
            .map(|name| {
                ExecutorHandle::new(
                    response
                        .executor_namespace
                        .filter(|ns| !ns.is_empty())
                        .unwrap_or_else(|| ExecutorHandle::DEFAULT_NAMESPACE.to_string()),
                    name,
                )
            }))
    }

    async fn cancel(&self, task_id: TaskId) -> Result<()> {
        self.post("tasks/cancel", &CancelRequest { task_id }, self.cancel_timeout)
            .await?;
        Ok(())
    }

    async fn delete_executor(&self, executor: &ExecutorHandle) -> Result<()> {
        self.post(
            "executor/delete",
            &DeleteRequest {
                executor_name: &executor.name,
                executor_namespace: &executor.namespace,
            },
            self.delete_timeout,
        )
        .await?;
        Ok(())
    }
}

/// Executor that forwards to a remote agent
pub struct RemoteExecutor {
    rpc: Arc<dyn ExecutorRpc>,
    bridge: Arc<PersistenceBridge>,
    dispatch_timeout: Duration,
    cancel_timeout: Duration,
}

impl RemoteExecutor {
    pub fn new(rpc: Arc<dyn ExecutorRpc>, bridge: Arc<PersistenceBridge>, config: &RemoteConfig) -> Self {
        Self {
            rpc,
            bridge,
            dispatch_timeout: config.dispatch_timeout(),
            cancel_timeout: config.cancel_timeout(),
        }
    }
}

#[async_trait]
impl Executor for RemoteExecutor {
    async fn start(&self, subtask: &Subtask) -> Result<()> {
        let dispatched = tokio::time::timeout(self.dispatch_timeout, self.rpc.dispatch(subtask))
            .await
            .unwrap_or_else(|_| {
                Err(Error::Timeout(format!(
                    "dispatch of subtask {} after {:?}",
                    subtask.id, self.dispatch_timeout
                )))
            });

        match dispatched {
            Ok(Some(handle)) => {
                info!(subtask_id = %subtask.id, executor = %handle, "Subtask dispatched");
                self.bridge.bind_executor(subtask.id, handle).await?;
                Ok(())
            }
            Ok(None) => {
                info!(subtask_id = %subtask.id, "Subtask dispatched, executor pending");
                Ok(())
            }
            Err(e) => {
                warn!(subtask_id = %subtask.id, error = %e, "Dispatch failed");
                let failed = Chunk::new(
                    subtask.task_id,
                    subtask.id,
                    ChunkPayload::failed(format!("dispatch failed: {}", e)),
                );
                self.bridge.apply_chunk(failed).await?;
                Err(e)
            }
        }
    }

    async fn cancel(&self, subtask: &Subtask) -> Result<CancelAck> {
        tokio::time::timeout(self.cancel_timeout, self.rpc.cancel(subtask.task_id))
            .await
            .unwrap_or_else(|_| {
                Err(Error::Timeout(format!(
                    "cancel of task {} after {:?}",
                    subtask.task_id, self.cancel_timeout
                )))
            })?;
        debug!(task_id = %subtask.task_id, "Remote cancel acknowledged");
        Ok(CancelAck::default())
    }

    fn name(&self) -> &'static str {
        "remote"
    }
}
