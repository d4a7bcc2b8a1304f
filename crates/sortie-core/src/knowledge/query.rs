//! Entity queries
//!
//! Queries are plain data so that workflow branch preconditions and intent
//! follow-ups can be written in TOML/JSON and evaluated later against the
//! store or against a context snapshot.

use serde::{Deserialize, Serialize};

use super::entity::{Entity, EntityKind};
use crate::types::value_to_text;

/// A single attribute predicate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum AttributePredicate {
    /// Attribute equals the value exactly
    Equals {
        name: String,
        value: serde_json::Value,
    },

    /// Attribute is present
    Exists { name: String },

    /// String attribute contains the needle (case-insensitive), or array attribute holds it
    Contains { name: String, needle: String },

    /// Entity carries the tag
    HasTag { tag: String },
}

impl AttributePredicate {
    pub fn matches(&self, entity: &Entity) -> bool {
        match self {
            AttributePredicate::Equals { name, value } => entity.attribute(name) == Some(value),
            AttributePredicate::Exists { name } => entity.attribute(name).is_some(),
            AttributePredicate::Contains { name, needle } => match entity.attribute(name) {
                Some(serde_json::Value::Array(items)) => items
                    .iter()
                    .any(|item| value_to_text(item).eq_ignore_ascii_case(needle)),
                Some(value) => value_to_text(value)
                    .to_lowercase()
                    .contains(&needle.to_lowercase()),
                None => false,
            },
            AttributePredicate::HasTag { tag } => entity.has_tag(tag),
        }
    }
}

/// Conjunction of attribute predicates
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AttributeFilter {
    pub predicates: Vec<AttributePredicate>,
}

impl AttributeFilter {
    pub fn any() -> Self {
        Self::default()
    }

    pub fn matches(&self, entity: &Entity) -> bool {
        self.predicates.iter().all(|p| p.matches(entity))
    }

    pub fn is_empty(&self) -> bool {
        self.predicates.is_empty()
    }
}

/// Type filter plus attribute filter
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityQuery {
    #[serde(default)]
    pub kind: Option<EntityKind>,
    #[serde(default)]
    pub filter: AttributeFilter,
}

impl EntityQuery {
    pub fn of(kind: EntityKind) -> Self {
        Self {
            kind: Some(kind),
            filter: AttributeFilter::any(),
        }
    }

    pub fn any() -> Self {
        Self::default()
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.filter
            .predicates
            .push(AttributePredicate::HasTag { tag: tag.into() });
        self
    }

    pub fn where_eq(mut self, name: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.filter.predicates.push(AttributePredicate::Equals {
            name: name.into(),
            value: value.into(),
        });
        self
    }

    pub fn where_exists(mut self, name: impl Into<String>) -> Self {
        self.filter
            .predicates
            .push(AttributePredicate::Exists { name: name.into() });
        self
    }

    pub fn where_contains(mut self, name: impl Into<String>, needle: impl Into<String>) -> Self {
        self.filter.predicates.push(AttributePredicate::Contains {
            name: name.into(),
            needle: needle.into(),
        });
        self
    }

    pub fn matches(&self, entity: &Entity) -> bool {
        self.kind.map_or(true, |kind| entity.kind == kind) && self.filter.matches(entity)
    }
}

/// Binds a parameter to an attribute of every entity a query matches.
///
/// Used for "do X to every Y discovered so far" steps: one request is
/// produced per distinct attribute value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityBinding {
    pub query: EntityQuery,

    /// Request parameter receiving the value
    pub parameter: String,

    /// Entity attribute supplying the value (`identity_key` allowed)
    pub attribute: String,
}

impl EntityBinding {
    pub fn new(query: EntityQuery, parameter: impl Into<String>, attribute: impl Into<String>) -> Self {
        Self {
            query,
            parameter: parameter.into(),
            attribute: attribute.into(),
        }
    }

    /// Distinct bound values in first-seen order
    pub fn values<'a>(&self, entities: impl IntoIterator<Item = &'a Entity>) -> Vec<String> {
        let mut seen = std::collections::BTreeSet::new();
        entities
            .into_iter()
            .filter(|e| self.query.matches(e))
            .filter_map(|e| e.attribute_text(&self.attribute))
            .filter(|v| !v.trim().is_empty() && seen.insert(v.clone()))
            .collect()
    }
}
