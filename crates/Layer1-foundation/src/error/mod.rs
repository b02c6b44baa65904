//! Error types for Relay
//!
//! All cross-crate errors are funneled through [`Error`]. Components with a
//! richer taxonomy of their own (chunk decoding, interactive requests) keep a
//! local enum and convert at their boundary.

use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Relay error type
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Configuration
    // ========================================================================
    #[error("Configuration error: {0}")]
    Config(String),

    // ========================================================================
    // Storage
    // ========================================================================
    #[error("Storage error: {0}")]
    Storage(String),

    /// Optimistic write lost against a concurrent writer
    #[error("Write conflict: {0}")]
    Conflict(String),

    // ========================================================================
    // Lifecycle
    // ========================================================================
    #[error("Invalid status transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    // ========================================================================
    // Execution
    // ========================================================================
    #[error("Executor error: {0}")]
    Executor(String),

    #[error("Provider error: {0}")]
    Provider(String),

    #[error("Tool error: {0}")]
    Tool(String),

    #[error("PTY error: {0}")]
    Pty(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Cancelled")]
    Cancelled,

    // ========================================================================
    // General
    // ========================================================================
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    // ========================================================================
    // External
    // ========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether retrying the same operation may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Conflict(_) | Error::Timeout(_) | Error::Http(_) | Error::Executor(_)
        )
    }

    /// Remote-side failures that are logged and left for the next attempt
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Timeout(_) | Error::Http(_) | Error::Executor(_))
    }

    /// Build an invalid-transition error from anything displayable
    pub fn transition(from: impl std::fmt::Display, to: impl std::fmt::Display) -> Self {
        Error::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        }
    }
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Error::Config(e.to_string())
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Internal(s)
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Internal(s.to_string())
    }
}
