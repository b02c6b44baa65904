//! # relay-foundation
//!
//! Foundation layer for Relay:
//! - Error: shared `Error` / `Result`
//! - Event: publish/subscribe bus with isolated handler failures
//! - Config: `RelayConfig` (TOML + environment overrides)

pub mod config;
pub mod error;
pub mod event;

// ============================================================================
// Error
// ============================================================================
pub use error::{Error, Result};

// ============================================================================
// Config
// ============================================================================
pub use config::{
    AgentConfig, InteractiveConfig, PersistenceConfig, ReaperConfig, RelayConfig, RemoteConfig,
    RELAY_CONFIG_FILE,
};

// ============================================================================
// Event
// ============================================================================
pub use event::{
    DispatchReport, EventBus, EventBusConfig, EventCategory, EventFilter, EventHandler,
    EventSeverity, HandlerFailure, HandlerId, RelayEvent,
};
