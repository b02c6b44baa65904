//! Event System - publish/subscribe for lifecycle notifications
//!
//! ```text
//! bridge / cancel / reaper / interactive
//!            │ publish(event)
//!            ▼
//!   ┌──────────────────┐
//!   │     EventBus     │──► broadcast receivers
//!   └──────────────────┘
//!     │       │       │   (each invocation isolated)
//!     ▼       ▼       ▼
//!  handler handler handler
//! ```

pub mod bus;
pub mod types;

pub use bus::{
    DispatchReport, EventBus, EventBusConfig, EventFilter, EventHandler, HandlerFailure, HandlerId,
};

pub use types::{
    chunk, executor, interactive, subtask, EventCategory, EventId, EventSeverity, RelayEvent,
};
