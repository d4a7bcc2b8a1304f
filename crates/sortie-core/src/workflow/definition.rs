//! Workflow definitions
//!
//! Plain data, loadable from TOML or JSON:
//!
//! ```toml
//! name = "external-recon"
//! policy = "conditional"
//!
//! [[steps]]
//! name = "discover"
//! critical = true
//! actions = [{ action = "scan", parameters = { target = "10.0.0.0/24" } }]
//! branches = [{ next = "web", precondition = { kind = "host", filter = [{ op = "has_tag", tag = "http" }] } }]
//!
//! [[steps]]
//! name = "web"
//! actions = [{ action = "web_scan", fan_out = { parameter = "target", attribute = "address", query = { kind = "host", filter = [{ op = "has_tag", tag = "http" }] } } }]
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

use crate::error::{OrchestratorError, Result};
use crate::intent::IntentResolution;
use crate::knowledge::{Entity, EntityBinding, EntityQuery};
use crate::types::ParameterMap;

/// How a run picks its next step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdvancePolicy {
    /// Every step in order, whatever the outcomes
    #[default]
    Sequential,

    /// Branch preconditions pick the next step; a step without branches
    /// falls through to the following one
    Conditional,

    /// Scripted steps first, then steps suggested by the intent resolver
    Adaptive,
}

/// One action of a step, before dependency resolution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionTemplate {
    pub action: String,

    #[serde(default)]
    pub parameters: ParameterMap,

    /// Expand into one request per distinct bound value
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fan_out: Option<EntityBinding>,
}

impl ActionTemplate {
    pub fn new(action: impl Into<String>, parameters: ParameterMap) -> Self {
        Self {
            action: action.into(),
            parameters,
            fan_out: None,
        }
    }

    pub fn with_parameter(mut self, name: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.parameters.insert(name.into(), value.into());
        self
    }

    pub fn fanned_out(mut self, binding: EntityBinding) -> Self {
        self.fan_out = Some(binding);
        self
    }

    /// Parameter sets for the requests this template produces against the
    /// given entities. A fan-out with no matching entity produces nothing.
    pub fn expand(&self, entities: &[Entity]) -> Vec<ParameterMap> {
        let Some(binding) = &self.fan_out else {
            return vec![self.parameters.clone()];
        };
        binding
            .values(entities)
            .into_iter()
            .map(|value| {
                let mut parameters = self.parameters.clone();
                parameters.insert(binding.parameter.clone(), serde_json::Value::String(value));
                parameters
            })
            .collect()
    }
}

/// Conditional edge: jump to `next` when any entity matches
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Branch {
    pub precondition: EntityQuery,
    pub next: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepSpec {
    pub name: String,
    pub actions: Vec<ActionTemplate>,

    /// Any failure in this step aborts the run
    #[serde(default)]
    pub critical: bool,

    /// Evaluated in order under the conditional policy; first match wins
    #[serde(default)]
    pub branches: Vec<Branch>,
}

impl StepSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            actions: Vec::new(),
            critical: false,
            branches: Vec::new(),
        }
    }

    pub fn with_action(mut self, template: ActionTemplate) -> Self {
        self.actions.push(template);
        self
    }

    pub fn critical(mut self) -> Self {
        self.critical = true;
        self
    }

    pub fn with_branch(mut self, precondition: EntityQuery, next: impl Into<String>) -> Self {
        self.branches.push(Branch {
            precondition,
            next: next.into(),
        });
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub name: String,

    #[serde(default)]
    pub policy: AdvancePolicy,

    /// Goal handed to the intent resolver when suggesting adaptive steps
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub goal: Option<String>,

    #[serde(default)]
    pub steps: Vec<StepSpec>,
}

impl WorkflowDefinition {
    pub fn new(name: impl Into<String>, policy: AdvancePolicy) -> Self {
        Self {
            name: name.into(),
            policy,
            goal: None,
            steps: Vec::new(),
        }
    }

    pub fn with_step(mut self, step: StepSpec) -> Self {
        self.steps.push(step);
        self
    }

    pub fn with_goal(mut self, goal: impl Into<String>) -> Self {
        self.goal = Some(goal.into());
        self
    }

    /// Turn a resolved command into a run: one step per stage, then one
    /// step per follow-up, linked by conditional branches so a follow-up
    /// only runs once something matching its binding exists.
    pub fn from_resolution(resolution: &IntentResolution) -> Self {
        let mut definition = WorkflowDefinition::new(resolution.text.clone(), AdvancePolicy::Conditional);

        for (i, stage) in resolution.stages.iter().filter(|s| !s.is_empty()).enumerate() {
            let mut step = StepSpec::new(format!("stage-{}", i + 1));
            for candidate in stage {
                step = step.with_action(ActionTemplate::new(candidate.action.clone(), candidate.parameters.clone()));
            }
            definition.steps.push(step);
        }

        let first_follow_up = definition.steps.len();
        for (i, follow_up) in resolution.follow_ups.iter().enumerate() {
            let template = ActionTemplate::new(follow_up.action.clone(), follow_up.parameters.clone())
                .fanned_out(follow_up.binding.clone());
            definition
                .steps
                .push(StepSpec::new(format!("follow-up-{}", i + 1)).with_action(template));
        }

        // Each step before a follow-up may jump to any later follow-up whose
        // binding matches, nearest first
        let total = definition.steps.len();
        for from in first_follow_up.saturating_sub(1)..total {
            let branches: Vec<Branch> = ((from + 1).max(first_follow_up)..total)
                .map(|to| Branch {
                    precondition: resolution.follow_ups[to - first_follow_up].binding.query.clone(),
                    next: definition.steps[to].name.clone(),
                })
                .collect();
            definition.steps[from].branches = branches;
        }

        definition
    }

    pub fn step_index(&self, name: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.name == name)
    }

    /// Structural checks: unique non-empty step names, at least one action
    /// per step, branch targets that exist and lie ahead of their step
    pub fn validate(&self) -> Result<()> {
        if self.steps.is_empty() && self.policy != AdvancePolicy::Adaptive {
            return Err(OrchestratorError::Validation(format!("workflow '{}' has no steps", self.name)));
        }

        let mut names = HashSet::new();
        for step in &self.steps {
            if step.name.trim().is_empty() {
                return Err(OrchestratorError::Validation("step name cannot be empty".into()));
            }
            if !names.insert(step.name.as_str()) {
                return Err(OrchestratorError::Validation(format!("duplicate step '{}'", step.name)));
            }
            if step.actions.is_empty() {
                return Err(OrchestratorError::Validation(format!("step '{}' has no actions", step.name)));
            }
        }

        for (index, step) in self.steps.iter().enumerate() {
            for branch in &step.branches {
                match self.step_index(&branch.next) {
                    Some(target) if target > index => {}
                    Some(_) => {
                        return Err(OrchestratorError::Validation(format!(
                            "branch from '{}' to '{}' must point forward",
                            step.name, branch.next
                        )))
                    }
                    None => {
                        return Err(OrchestratorError::Validation(format!(
                            "branch from '{}' targets unknown step '{}'",
                            step.name, branch.next
                        )))
                    }
                }
            }
        }
        Ok(())
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        let definition: Self =
            toml::from_str(text).map_err(|e| OrchestratorError::Config(format!("invalid workflow: {}", e)))?;
        definition.validate()?;
        Ok(definition)
    }

    pub fn from_json_str(text: &str) -> Result<Self> {
        let definition: Self = serde_json::from_str(text)?;
        definition.validate()?;
        Ok(definition)
    }

    /// Load a `.json` or `.toml` definition
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json_str(&text),
            _ => Self::from_toml_str(&text),
        }
    }
}
