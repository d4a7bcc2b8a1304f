//! Dependency resolution
//!
//! Fills the parameters a command left out from what earlier actions
//! discovered. Resolution is a pure function of (descriptor, supplied
//! parameters, context snapshot): the resolver holds no state besides the
//! frozen registry, so re-running it for a retry yields the same answer.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::{DependencyCandidate, OrchestratorError, Result};
use crate::knowledge::{ContextSummary, EntityId};
use crate::registry::{EntitySource, ModuleDescriptor, ModuleRegistry, ParameterSpec};
use crate::types::{value_to_text, ParameterMap};

/// Where a resolved parameter value came from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "from", rename_all = "snake_case")]
pub enum ParameterOrigin {
    Supplied,
    Entity { entity: EntityId, revision: u64 },
    Default,
}

/// One entry of the resolution trace
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilledParameter {
    pub name: String,
    pub value: serde_json::Value,
    pub origin: ParameterOrigin,
}

/// A request whose parameters satisfy the module's schema
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedAction {
    pub action: String,
    pub parameters: ParameterMap,

    /// Per-parameter trace, in parameter-name order
    pub filled: Vec<FilledParameter>,
}

impl ResolvedAction {
    /// Parameters that did not come from the caller
    pub fn inferred(&self) -> impl Iterator<Item = &FilledParameter> {
        self.filled
            .iter()
            .filter(|f| !matches!(f.origin, ParameterOrigin::Supplied))
    }
}

/// Fills missing parameters from prior findings
#[derive(Debug, Clone)]
pub struct DependencyResolver {
    registry: Arc<ModuleRegistry>,
}

impl DependencyResolver {
    pub fn new(registry: Arc<ModuleRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<ModuleRegistry> {
        &self.registry
    }

    /// Resolve `action` against a context snapshot.
    ///
    /// # Errors
    ///
    /// - `ModuleNotFound` for an unknown action
    /// - `Validation` for an unknown parameter name or a value of the wrong kind
    /// - `AmbiguousDependency` when several equally recent entities offer
    ///   different values for a required parameter
    /// - `UnresolvedDependency` when a required parameter has no supplied
    ///   value, no candidate and no default
    pub fn resolve(&self, action: &str, supplied: &ParameterMap, snapshot: &ContextSummary) -> Result<ResolvedAction> {
        let descriptor = self.registry.lookup(action)?;
        resolve_with(&descriptor, supplied, snapshot)
    }
}

/// Resolution against an explicit descriptor
pub fn resolve_with(
    descriptor: &ModuleDescriptor,
    supplied: &ParameterMap,
    snapshot: &ContextSummary,
) -> Result<ResolvedAction> {
    for name in supplied.keys() {
        if !descriptor.parameters.contains_key(name) {
            return Err(OrchestratorError::Validation(format!(
                "action '{}' has no parameter '{}'",
                descriptor.action, name
            )));
        }
    }

    let mut parameters = ParameterMap::new();
    let mut filled = Vec::with_capacity(descriptor.parameters.len());

    for (name, spec) in &descriptor.parameters {
        let resolved = match supplied.get(name) {
            Some(value) if !value.is_null() => {
                let value = normalize(descriptor, name, spec, value)?;
                Some((value, ParameterOrigin::Supplied))
            }
            _ if spec.required => Some(fill_required(descriptor, name, spec, snapshot)?),
            _ => spec
                .default
                .clone()
                .map(|value| (value, ParameterOrigin::Default)),
        };

        if let Some((value, origin)) = resolved {
            parameters.insert(name.clone(), value.clone());
            filled.push(FilledParameter {
                name: name.clone(),
                value,
                origin,
            });
        }
    }

    Ok(ResolvedAction {
        action: descriptor.action.clone(),
        parameters,
        filled,
    })
}

fn normalize(
    descriptor: &ModuleDescriptor,
    name: &str,
    spec: &ParameterSpec,
    value: &serde_json::Value,
) -> Result<serde_json::Value> {
    spec.kind.normalize(value).ok_or_else(|| {
        OrchestratorError::Validation(format!(
            "action '{}': parameter '{}' expects a {}, got {}",
            descriptor.action, name, spec.kind, value
        ))
    })
}

fn fill_required(
    descriptor: &ModuleDescriptor,
    name: &str,
    spec: &ParameterSpec,
    snapshot: &ContextSummary,
) -> Result<(serde_json::Value, ParameterOrigin)> {
    if let Some(source) = &spec.source {
        let mut candidates = newest_candidates(source, snapshot);
        if candidates.len() > 1 {
            return Err(OrchestratorError::AmbiguousDependency {
                action: descriptor.action.clone(),
                parameter: name.to_string(),
                candidates: candidates.into_iter().map(|(c, _)| c).collect(),
            });
        }
        if let Some((candidate, revision)) = candidates.pop() {
            let value = normalize(descriptor, name, spec, &serde_json::Value::String(candidate.value))?;
            return Ok((
                value,
                ParameterOrigin::Entity {
                    entity: candidate.entity,
                    revision,
                },
            ));
        }
    }

    match &spec.default {
        Some(value) => Ok((value.clone(), ParameterOrigin::Default)),
        None => Err(OrchestratorError::UnresolvedDependency {
            action: descriptor.action.clone(),
            parameter: name.to_string(),
        }),
    }
}

/// Distinct candidate values at the highest revision among matching entities,
/// ordered by value
fn newest_candidates(source: &EntitySource, snapshot: &ContextSummary) -> Vec<(DependencyCandidate, u64)> {
    let attribute = source.attribute_name();
    let matching: Vec<(DependencyCandidate, u64)> = snapshot
        .entities_of(source.kind)
        .filter(|e| source.filter.matches(e))
        .filter_map(|e| {
            e.attribute_text(attribute).filter(|v| !v.trim().is_empty()).map(|value| {
                (
                    DependencyCandidate {
                        entity: e.id.clone(),
                        value,
                    },
                    e.revision,
                )
            })
        })
        .collect();

    let Some(newest) = matching.iter().map(|(_, rev)| *rev).max() else {
        return Vec::new();
    };

    // Same value from two entities is not an ambiguity
    let mut by_value: BTreeMap<String, (DependencyCandidate, u64)> = BTreeMap::new();
    for (candidate, revision) in matching.into_iter().filter(|(_, rev)| *rev == newest) {
        by_value.entry(candidate.value.clone()).or_insert((candidate, revision));
    }
    by_value.into_values().collect()
}

/// Human-readable rendering of the parameters, used in logs and plans
pub fn describe_parameters(parameters: &ParameterMap) -> String {
    parameters
        .iter()
        .map(|(k, v)| format!("{}={}", k, value_to_text(v)))
        .collect::<Vec<_>>()
        .join(" ")
}
