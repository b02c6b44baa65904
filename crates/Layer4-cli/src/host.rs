//! Wiring shared by the commands: SQLite store, bridge, executor client

use anyhow::Context;
use async_trait::async_trait;
use relay_foundation::{EventBus, EventHandler, RelayConfig, RelayEvent};
use relay_task::{
    CancellationCoordinator, HttpExecutorClient, PersistenceBridge, RemoteExecutor, SqliteStore,
    StaleExecutorReaper,
};
use std::sync::Arc;
use tracing::debug;

/// Mirrors bus events into the log
struct LogEventHandler;

#[async_trait]
impl EventHandler for LogEventHandler {
    fn name(&self) -> &str {
        "log"
    }

    async fn handle(&self, event: &RelayEvent) -> relay_foundation::Result<()> {
        debug!(event_type = %event.event_type, data = %event.data, "Event");
        Ok(())
    }
}

pub struct Host {
    pub config: RelayConfig,
    pub bridge: Arc<PersistenceBridge>,
    pub rpc: Arc<HttpExecutorClient>,
}

impl Host {
    pub async fn open(config: RelayConfig) -> anyhow::Result<Self> {
        let path = config.database_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let store = SqliteStore::open(&path)
            .with_context(|| format!("opening database {}", path.display()))?;
        debug!(path = %path.display(), "Database opened");

        let events = Arc::new(EventBus::new());
        events.subscribe(Arc::new(LogEventHandler)).await;

        let bridge = Arc::new(PersistenceBridge::new(
            Arc::new(store),
            events,
            &config.persistence,
        ));
        let rpc = Arc::new(HttpExecutorClient::new(&config.remote)?);

        Ok(Self { config, bridge, rpc })
    }

    /// The CLI never owns a live local stream, so only the remote path is wired
    pub fn coordinator(&self) -> CancellationCoordinator {
        let remote = RemoteExecutor::new(
            self.rpc.clone(),
            Arc::clone(&self.bridge),
            &self.config.remote,
        );
        CancellationCoordinator::new(Arc::clone(&self.bridge)).with_remote_executor(Arc::new(remote))
    }

    pub fn reaper(&self) -> StaleExecutorReaper {
        StaleExecutorReaper::new(
            Arc::clone(&self.bridge),
            self.rpc.clone(),
            self.config.reaper.clone(),
            self.config.remote.delete_timeout(),
        )
    }
}
