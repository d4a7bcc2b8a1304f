//! Action requests and action results
//!
//! An [`ActionRequest`] is the unit of work: one fully parameterized module
//! invocation. It is created by the intent path or the workflow engine,
//! consumed exactly once by the scheduler and never mutated afterwards (the
//! scheduler wraps it in an `Arc` on submission).
//!
//! An [`ActionResult`] is the terminal outcome of one request. The error
//! detail is present iff the status is not [`ResultStatus::Success`]; the
//! constructors below are the only way the core builds results, which keeps
//! that invariant in one place.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::error::{ErrorClass, ErrorDetail};
use crate::knowledge::Entity;
use crate::resolver::ResolvedAction;
use crate::types::{now, ParameterMap, RequestId, Timestamp, WorkflowRunId};

/// Causal link from a request to the workflow step that spawned it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRef {
    pub run_id: WorkflowRunId,
    pub step_index: usize,
    pub step_name: String,
}

/// Scheduling priority; decides who gets a freed execution slot first
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
            Priority::Critical => "critical",
        };
        f.write_str(label)
    }
}

/// A fully parameterized instruction to run one module
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRequest {
    pub id: RequestId,

    /// Action identifier (a module registry key)
    pub action: String,

    /// Resolved parameters
    pub parameters: ParameterMap,

    /// Originating command text, kept for audit
    pub origin: Option<String>,

    /// Workflow step that spawned this request (None for ad-hoc commands)
    pub step: Option<StepRef>,

    #[serde(default)]
    pub priority: Priority,

    pub created_at: Timestamp,
}

impl ActionRequest {
    pub fn new(action: impl Into<String>, parameters: ParameterMap) -> Self {
        Self {
            id: RequestId::new(),
            action: action.into(),
            parameters,
            origin: None,
            step: None,
            priority: Priority::default(),
            created_at: now(),
        }
    }

    /// Build a request from a dependency-resolved action
    pub fn from_resolved(resolved: ResolvedAction) -> Self {
        Self::new(resolved.action, resolved.parameters)
    }

    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    pub fn with_step(mut self, step: StepRef) -> Self {
        self.step = Some(step);
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn parameter(&self, name: &str) -> Option<&serde_json::Value> {
        self.parameters.get(name)
    }
}

/// Terminal status of an action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Success,
    Failure,
    Timeout,
    Cancelled,
}

impl fmt::Display for ResultStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ResultStatus::Success => "success",
            ResultStatus::Failure => "failure",
            ResultStatus::Timeout => "timeout",
            ResultStatus::Cancelled => "cancelled",
        };
        f.write_str(label)
    }
}

/// Outcome of one action request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionResult {
    pub request_id: RequestId,
    pub action: String,
    pub status: ResultStatus,

    /// Entities produced by the module (empty unless the status is success)
    pub entities: Vec<Entity>,

    /// Free-form structured payload returned by the module
    pub payload: serde_json::Value,

    /// Present iff `status != Success`
    pub error: Option<ErrorDetail>,

    pub duration: Duration,

    /// Number of execution attempts (0 when the request never reached a module)
    pub attempts: u32,

    pub finished_at: Timestamp,
}

impl ActionResult {
    pub fn success(
        request: &ActionRequest,
        entities: Vec<Entity>,
        payload: serde_json::Value,
        duration: Duration,
        attempts: u32,
    ) -> Self {
        Self {
            request_id: request.id,
            action: request.action.clone(),
            status: ResultStatus::Success,
            entities,
            payload,
            error: None,
            duration,
            attempts,
            finished_at: now(),
        }
    }

    pub fn failure(request: &ActionRequest, error: ErrorDetail, duration: Duration, attempts: u32) -> Self {
        Self::terminal(request, ResultStatus::Failure, error, duration, attempts)
    }

    pub fn timed_out(request: &ActionRequest, limit: Duration, duration: Duration, attempts: u32) -> Self {
        let error = ErrorDetail::new(
            ErrorClass::Timeout,
            format!("no completion within {}ms", limit.as_millis()),
        );
        Self::terminal(request, ResultStatus::Timeout, error, duration, attempts)
    }

    pub fn cancelled(request: &ActionRequest, reason: impl Into<String>, duration: Duration, attempts: u32) -> Self {
        let error = ErrorDetail::new(ErrorClass::Cancelled, reason);
        Self::terminal(request, ResultStatus::Cancelled, error, duration, attempts)
    }

    fn terminal(
        request: &ActionRequest,
        status: ResultStatus,
        error: ErrorDetail,
        duration: Duration,
        attempts: u32,
    ) -> Self {
        Self {
            request_id: request.id,
            action: request.action.clone(),
            status,
            entities: Vec::new(),
            payload: serde_json::Value::Null,
            error: Some(error),
            duration,
            attempts,
            finished_at: now(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ResultStatus::Success
    }

    pub fn error_class(&self) -> Option<ErrorClass> {
        self.error.as_ref().map(|e| e.class)
    }
}
