use serde::{Deserialize, Serialize};
use std::fmt;

/// Task state definitions for the result state machine.
///
/// Transitions are monotonic toward a terminal state along
/// Pending -> Started -> {Success | Failure | Retry}; the only backward edge
/// is Retry -> Pending, which re-enters the machine for the next delivery of
/// the same lineage. Revoked may be entered from any non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Initial state when a task_id is first observed
    Pending,
    /// A worker slot is executing the handler
    Started,
    /// Delivery failed retryably; a new delivery of the lineage is scheduled
    Retry,
    /// Task completed successfully
    Success,
    /// Task failed terminally
    Failure,
    /// Task was cancelled; deliveries short-circuit without handler invocation
    Revoked,
}

impl TaskState {
    /// Check if this is a terminal state (no further transitions allowed)
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failure | Self::Revoked)
    }

    /// Check if a worker slot is currently processing the task
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Started)
    }

    /// Whether the state machine allows moving from `self` to `next`.
    ///
    /// Terminal states accept no transitions; writes against them are
    /// treated as no-ops by the state store, which is what makes redelivery
    /// after SUCCESS idempotent.
    pub fn can_transition_to(&self, next: TaskState) -> bool {
        match self {
            Self::Pending => matches!(
                next,
                Self::Started | Self::Revoked | Self::Failure
            ),
            Self::Started => matches!(
                next,
                Self::Success | Self::Failure | Self::Retry | Self::Revoked
            ),
            Self::Retry => matches!(next, Self::Pending | Self::Revoked),
            Self::Success | Self::Failure | Self::Revoked => false,
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Started => write!(f, "started"),
            Self::Retry => write!(f, "retry"),
            Self::Success => write!(f, "success"),
            Self::Failure => write!(f, "failure"),
            Self::Revoked => write!(f, "revoked"),
        }
    }
}

impl std::str::FromStr for TaskState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "started" => Ok(Self::Started),
            "retry" => Ok(Self::Retry),
            "success" => Ok(Self::Success),
            "failure" => Ok(Self::Failure),
            "revoked" => Ok(Self::Revoked),
            _ => Err(format!("Invalid task state: {s}")),
        }
    }
}

/// External job state as reported by the pipeline backend, normalized away
/// from any backend-specific vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendJobState {
    Running,
    Succeeded,
    Failed,
    /// Backend could not report a state (e.g. transient API failure). The
    /// poll loop keeps going; Unknown is never terminal.
    Unknown,
}

impl BackendJobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

impl fmt::Display for BackendJobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}
