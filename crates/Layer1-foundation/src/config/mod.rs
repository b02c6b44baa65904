//! Config - runtime settings
//!
//! - `relay.rs` - `RelayConfig` and its sections

mod relay;

pub use relay::{
    AgentConfig, InteractiveConfig, PersistenceConfig, ReaperConfig, RelayConfig, RemoteConfig,
    ENV_DATABASE, ENV_EXECUTOR_URL, RELAY_CONFIG_FILE,
};
