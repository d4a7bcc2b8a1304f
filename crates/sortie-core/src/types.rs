//! Core types for Sortie
//!
//! This module defines the fundamental identifiers and aliases shared by every component:
//! - Timestamps
//! - Session, request and workflow-run identifiers
//! - Parameter maps

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Timestamp type alias
pub type Timestamp = DateTime<Utc>;

/// Create a timestamp for the current moment
pub fn now() -> Timestamp {
    Utc::now()
}

/// Parameter name -> value mapping carried by action requests.
///
/// A `BTreeMap` keeps iteration order stable, which keeps prompts and
/// resolution output deterministic.
pub type ParameterMap = BTreeMap<String, serde_json::Value>;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, ":{}"), self.0)
            }
        }
    };
}

uuid_id!(
    /// Unique session identifier
    SessionId,
    "session"
);

uuid_id!(
    /// Unique action request identifier
    RequestId,
    "request"
);

uuid_id!(
    /// Unique workflow run identifier
    WorkflowRunId,
    "run"
);

/// Session lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Paused,
    Closed,
}

impl SessionStatus {
    pub fn can_transition_to(self, next: SessionStatus) -> bool {
        use SessionStatus::*;
        match (self, next) {
            (Closed, _) => false,
            (Active, Paused) | (Paused, Active) => true,
            (Active, Closed) | (Paused, Closed) => true,
            (s1, s2) if s1 == s2 => true,
            _ => false,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, SessionStatus::Closed)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Render a JSON parameter value the way targets and prompts expect it
/// (strings without quotes, everything else as compact JSON).
pub fn value_to_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
