//! Error types for Sortie Core
//!
//! This module defines the error taxonomy used throughout the orchestration core.
//! We use `thiserror` for ergonomic error definitions with automatic Display/Error implementations.
//!
//! Three boundaries have their own error types:
//! - [`OrchestratorError`]: everything the core surfaces to its callers
//! - [`ModuleError`]: what an executable module may report back to the scheduler
//! - [`OracleError`]: what a reasoning oracle may report back to the intent resolver

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::knowledge::EntityId;
use crate::types::SessionId;

/// Result type alias for Sortie operations
pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// Main error type for orchestration operations
#[derive(Error, Debug)]
pub enum OrchestratorError {
    /// Malformed input. Never retried.
    #[error("Validation error: {0}")]
    Validation(String),

    /// A required parameter has no supplied value, no matching entity and no default
    #[error("Unresolved dependency: action '{action}' is missing parameter '{parameter}'")]
    UnresolvedDependency { action: String, parameter: String },

    /// Several equally recent entities could fill the same parameter
    #[error("Ambiguous dependency: action '{action}' parameter '{parameter}' matches {} candidates", .candidates.len())]
    AmbiguousDependency {
        action: String,
        parameter: String,
        candidates: Vec<DependencyCandidate>,
    },

    /// Neither the oracle nor the rule matcher produced a candidate
    #[error("Intent unresolved for '{text}': {reason}")]
    IntentUnresolved { text: String, reason: String },

    /// A resolved parameter references a target outside the authorized scope
    #[error("Scope violation: target '{target}' is not authorized for action '{action}'")]
    ScopeViolation { action: String, target: String },

    #[error("Module not found: {0}")]
    ModuleNotFound(String),

    #[error("Module already registered: {0}")]
    DuplicateModule(String),

    #[error("Session {0} is closed")]
    SessionClosed(SessionId),

    #[error("Session {0} is paused")]
    SessionPaused(SessionId),

    #[error("Invalid state transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Workflow run not found: {0}")]
    WorkflowNotFound(String),

    /// Oracle failures that escaped the fallback path
    #[error("Oracle error: {0}")]
    Oracle(#[from] OracleError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic error with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        source: Box<OrchestratorError>,
    },
}

/// One candidate named by an [`OrchestratorError::AmbiguousDependency`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyCandidate {
    pub entity: EntityId,
    pub value: String,
}

impl fmt::Display for DependencyCandidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.value, self.entity)
    }
}

/// Errors raised by an executable module
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ModuleError {
    /// Transient failure; the scheduler retries per its policy
    #[error("Recoverable module error: {0}")]
    Recoverable(String),

    /// Permanent failure; no retry
    #[error("Fatal module error: {0}")]
    Fatal(String),
}

impl ModuleError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ModuleError::Recoverable(_))
    }
}

/// Errors raised by a reasoning oracle
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OracleError {
    #[error("Oracle timed out after {0}ms")]
    Timeout(u64),

    #[error("Oracle rate limited: {0}")]
    RateLimited(String),

    #[error("Malformed oracle response: {0}")]
    Malformed(String),

    #[error("Oracle unavailable: {0}")]
    Unavailable(String),

    #[error("Oracle transport error: {0}")]
    Transport(String),
}

/// Classification attached to every non-successful action result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Validation,
    UnresolvedDependency,
    AmbiguousDependency,
    ScopeViolation,
    Recoverable,
    Fatal,
    Timeout,
    Cancelled,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ErrorClass::Validation => "validation",
            ErrorClass::UnresolvedDependency => "unresolved_dependency",
            ErrorClass::AmbiguousDependency => "ambiguous_dependency",
            ErrorClass::ScopeViolation => "scope_violation",
            ErrorClass::Recoverable => "recoverable",
            ErrorClass::Fatal => "fatal",
            ErrorClass::Timeout => "timeout",
            ErrorClass::Cancelled => "cancelled",
        };
        f.write_str(label)
    }
}

/// Error detail recorded on a failed, timed-out or cancelled result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub class: ErrorClass,
    pub message: String,
}

impl ErrorDetail {
    pub fn new(class: ErrorClass, message: impl Into<String>) -> Self {
        Self {
            class,
            message: message.into(),
        }
    }
}

impl From<&ModuleError> for ErrorDetail {
    fn from(error: &ModuleError) -> Self {
        match error {
            ModuleError::Recoverable(msg) => ErrorDetail::new(ErrorClass::Recoverable, msg.clone()),
            ModuleError::Fatal(msg) => ErrorDetail::new(ErrorClass::Fatal, msg.clone()),
        }
    }
}

impl OrchestratorError {
    /// Add context to an error
    pub fn context(self, context: impl Into<String>) -> Self {
        Self::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// The innermost error, skipping context wrappers
    pub fn root(&self) -> &OrchestratorError {
        match self {
            OrchestratorError::WithContext { source, .. } => source.root(),
            other => other,
        }
    }

    /// Result classification for errors that end a request before dispatch
    pub fn class(&self) -> ErrorClass {
        match self.root() {
            OrchestratorError::UnresolvedDependency { .. } => ErrorClass::UnresolvedDependency,
            OrchestratorError::AmbiguousDependency { .. } => ErrorClass::AmbiguousDependency,
            OrchestratorError::ScopeViolation { .. } => ErrorClass::ScopeViolation,
            OrchestratorError::Validation(_) | OrchestratorError::ModuleNotFound(_) => {
                ErrorClass::Validation
            }
            _ => ErrorClass::Fatal,
        }
    }
}

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to a Result
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Add lazy context to a Result
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| e.context(f()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_context() {
        let err = OrchestratorError::ModuleNotFound("web_scan".to_string());
        let err = err.context("Failed to dispatch request");

        assert!(err.to_string().contains("Failed to dispatch request"));
        assert!(matches!(err.root(), OrchestratorError::ModuleNotFound(_)));
    }

    #[test]
    fn test_result_ext() {
        let result: Result<()> = Err(OrchestratorError::Validation("empty identity key".into()));
        let result = result.with_context(|| "Upsert failed".to_string());

        let err = result.unwrap_err();
        assert!(err.to_string().contains("Upsert failed"));
        assert_eq!(err.class(), ErrorClass::Validation);
    }

    #[test]
    fn test_ambiguous_dependency_message_counts_candidates() {
        let err = OrchestratorError::AmbiguousDependency {
            action: "web_scan".into(),
            parameter: "target".into(),
            candidates: vec![
                DependencyCandidate {
                    entity: EntityId::from_raw("a"),
                    value: "10.0.0.5".into(),
                },
                DependencyCandidate {
                    entity: EntityId::from_raw("b"),
                    value: "10.0.0.6".into(),
                },
            ],
        };

        assert!(err.to_string().contains("2 candidates"));
        assert_eq!(err.class(), ErrorClass::AmbiguousDependency);
    }

    #[test]
    fn test_module_error_retryability() {
        assert!(ModuleError::Recoverable("connection reset".into()).is_retryable());
        assert!(!ModuleError::Fatal("binary missing".into()).is_retryable());

        let detail = ErrorDetail::from(&ModuleError::Fatal("binary missing".into()));
        assert_eq!(detail.class, ErrorClass::Fatal);
    }
}
