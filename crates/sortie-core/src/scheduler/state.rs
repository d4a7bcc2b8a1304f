//! Per-request lifecycle

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::action::ResultStatus;

/// Where a request is in its lifecycle.
///
/// ```text
/// queued ──► running ──► succeeded | failed | timed_out | cancelled
///   │  ▲         │
///   │  └─────────┘ (retry)
///   └──► failed | cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestState {
    Queued,
    Running,
    Succeeded,
    Failed,
    TimedOut,
    Cancelled,
}

impl RequestState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RequestState::Succeeded | RequestState::Failed | RequestState::TimedOut | RequestState::Cancelled
        )
    }

    pub fn can_transition_to(self, next: RequestState) -> bool {
        use RequestState::*;
        match self {
            Queued => matches!(next, Running | Failed | Cancelled),
            Running => matches!(next, Queued | Succeeded | Failed | TimedOut | Cancelled),
            Succeeded | Failed | TimedOut | Cancelled => false,
        }
    }
}

impl From<ResultStatus> for RequestState {
    fn from(status: ResultStatus) -> Self {
        match status {
            ResultStatus::Success => RequestState::Succeeded,
            ResultStatus::Failure => RequestState::Failed,
            ResultStatus::Timeout => RequestState::TimedOut,
            ResultStatus::Cancelled => RequestState::Cancelled,
        }
    }
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RequestState::Queued => "queued",
            RequestState::Running => "running",
            RequestState::Succeeded => "succeeded",
            RequestState::Failed => "failed",
            RequestState::TimedOut => "timed_out",
            RequestState::Cancelled => "cancelled",
        };
        f.write_str(label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_are_final() {
        for state in [
            RequestState::Succeeded,
            RequestState::Failed,
            RequestState::TimedOut,
            RequestState::Cancelled,
        ] {
            assert!(state.is_terminal());
            assert!(!state.can_transition_to(RequestState::Running));
            assert!(!state.can_transition_to(RequestState::Queued));
        }
    }

    #[test]
    fn queued_request_cannot_time_out() {
        assert!(!RequestState::Queued.can_transition_to(RequestState::TimedOut));
        assert!(RequestState::Queued.can_transition_to(RequestState::Cancelled));
        assert!(RequestState::Running.can_transition_to(RequestState::Queued));
    }
}
