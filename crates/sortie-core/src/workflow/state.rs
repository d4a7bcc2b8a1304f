//! Run lifecycle and reporting

use serde::{Deserialize, Serialize};
use std::fmt;

use super::definition::AdvancePolicy;
use crate::action::{ActionResult, ResultStatus};
use crate::error::ErrorClass;
use crate::types::{now, RequestId, Timestamp, WorkflowRunId};

/// Lifecycle of a workflow run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Created,
    Running,
    Paused,
    Completed,
    Aborted,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunState::Completed | RunState::Aborted)
    }

    pub fn can_transition_to(self, next: RunState) -> bool {
        use RunState::*;
        match self {
            Created => matches!(next, Running | Aborted),
            Running => matches!(next, Paused | Completed | Aborted),
            Paused => matches!(next, Running | Aborted),
            Completed | Aborted => false,
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RunState::Created => "created",
            RunState::Running => "running",
            RunState::Paused => "paused",
            RunState::Completed => "completed",
            RunState::Aborted => "aborted",
        };
        f.write_str(label)
    }
}

/// Terminal outcome of one request inside a step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepAction {
    pub request_id: RequestId,
    pub action: String,
    pub status: ResultStatus,
    pub error_class: Option<ErrorClass>,
    pub entities: usize,
}

impl From<&ActionResult> for StepAction {
    fn from(result: &ActionResult) -> Self {
        Self {
            request_id: result.request_id,
            action: result.action.clone(),
            status: result.status,
            error_class: result.error_class(),
            entities: result.entities.len(),
        }
    }
}

/// What happened when a step was executed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepOutcome {
    pub index: usize,
    pub name: String,
    pub actions: Vec<StepAction>,

    /// Siblings were cancelled after a critical failure
    pub siblings_cancelled: bool,

    /// The run was aborted while this step was in flight
    pub interrupted: bool,

    pub started_at: Timestamp,
    pub finished_at: Timestamp,
}

impl StepOutcome {
    pub(crate) fn begin(index: usize, name: &str) -> Self {
        let at = now();
        Self {
            index,
            name: name.to_string(),
            actions: Vec::new(),
            siblings_cancelled: false,
            interrupted: false,
            started_at: at,
            finished_at: at,
        }
    }

    pub(crate) fn record(&mut self, result: &ActionResult) {
        self.actions.push(StepAction::from(result));
    }

    pub(crate) fn end(mut self) -> Self {
        self.finished_at = now();
        self
    }

    pub fn succeeded(&self) -> usize {
        self.actions
            .iter()
            .filter(|a| a.status == ResultStatus::Success)
            .count()
    }

    pub fn failed(&self) -> usize {
        self.actions.len() - self.succeeded()
    }

    pub fn has_failure(&self) -> bool {
        self.failed() > 0
    }
}

/// Externally visible state of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: WorkflowRunId,
    pub workflow: String,
    pub policy: AdvancePolicy,
    pub state: RunState,

    /// Index of the next step to execute
    pub cursor: usize,

    pub steps: Vec<StepOutcome>,

    /// Why the run paused or aborted, when it did
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    pub started_at: Timestamp,
    pub updated_at: Timestamp,
}

impl RunReport {
    pub fn requests(&self) -> impl Iterator<Item = &StepAction> {
        self.steps.iter().flat_map(|s| s.actions.iter())
    }

    pub fn actions_run(&self) -> Vec<&str> {
        self.requests().map(|a| a.action.as_str()).collect()
    }
}
