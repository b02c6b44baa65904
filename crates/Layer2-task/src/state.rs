//! Subtask/task state machine
//!
//! ```text
//! PENDING ──► RUNNING ──► COMPLETED
//!    │          │  ▲  └──► FAILED
//!    │          └──┘  └──► CANCELLED
//!    └──────────────────► (any terminal)
//! ```
//!
//! Terminal states are sticky; only an explicit retry moves FAILED or
//! CANCELLED back to PENDING.

use relay_foundation::{Error, Result};
use serde::{Deserialize, Serialize};

/// Lifecycle status shared by tasks and subtasks
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl Status {
    pub const TERMINAL: [Status; 3] = [Status::Completed, Status::Failed, Status::Cancelled];

    pub fn is_terminal(&self) -> bool {
        matches!(self, Status::Completed | Status::Failed | Status::Cancelled)
    }

    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    /// Whether the machine allows `self -> next`
    pub fn can_transition_to(&self, next: Status) -> bool {
        match (self, next) {
            (Status::Pending, _) => true,
            (Status::Running, Status::Pending) => false,
            (Status::Running, _) => true,
            _ => false,
        }
    }

    /// Validate and return the next status
    pub fn transition(self, next: Status) -> Result<Status> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(Error::transition(self, next))
        }
    }

    /// Explicit retry: FAILED/CANCELLED back to PENDING
    pub fn retry(self) -> Result<Status> {
        match self {
            Status::Failed | Status::Cancelled => Ok(Status::Pending),
            other => Err(Error::transition(other, Status::Pending)),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Pending => "PENDING",
            Status::Running => "RUNNING",
            Status::Completed => "COMPLETED",
            Status::Failed => "FAILED",
            Status::Cancelled => "CANCELLED",
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Status {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "PENDING" => Ok(Status::Pending),
            "RUNNING" => Ok(Status::Running),
            "COMPLETED" => Ok(Status::Completed),
            "FAILED" => Ok(Status::Failed),
            "CANCELLED" => Ok(Status::Cancelled),
            other => Err(Error::InvalidInput(format!("unknown status: {other}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_transitions() {
        assert!(Status::Pending.can_transition_to(Status::Running));
        assert!(Status::Pending.can_transition_to(Status::Cancelled));
        assert!(Status::Running.can_transition_to(Status::Running));
        assert!(Status::Running.can_transition_to(Status::Completed));
        assert!(Status::Running.can_transition_to(Status::Failed));
    }

    #[test]
    fn test_terminal_is_sticky() {
        for terminal in Status::TERMINAL {
            for next in [
                Status::Pending,
                Status::Running,
                Status::Completed,
                Status::Failed,
                Status::Cancelled,
            ] {
                assert!(!terminal.can_transition_to(next), "{terminal} -> {next}");
            }
        }
        assert!(Status::Completed.transition(Status::Running).is_err());
    }

    #[test]
    fn test_retry_only_from_failed_or_cancelled() {
        assert_eq!(Status::Failed.retry().unwrap(), Status::Pending);
        assert_eq!(Status::Cancelled.retry().unwrap(), Status::Pending);
        assert!(Status::Completed.retry().is_err());
        assert!(Status::Running.retry().is_err());
    }

    #[test]
    fn test_parse_and_serde() {
        assert_eq!("completed".parse::<Status>().unwrap(), Status::Completed);
        assert_eq!(
            serde_json::to_string(&Status::Cancelled).unwrap(),
            "\"CANCELLED\""
        );
        assert!("DELETE".parse::<Status>().is_err());
    }
}
