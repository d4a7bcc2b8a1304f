//! Subcommand implementations
//!
//! Everything here returns data; `main` decides how to print it.

use anyhow::{Context, Result};
use serde::Serialize;
use sortie_core::intent::FollowUp;
use sortie_core::knowledge::EntityQuery;
use sortie_core::policy::check_request;
use sortie_core::registry::CatalogFile;
use sortie_core::resolver::{resolve_with, FilledParameter};
use sortie_core::{
    ActionRequest, AuthorizedScope, CoreConfig, ErrorClass, IntentResolution, IntentResolver, KnowledgeStore,
    ModuleRegistry, ParameterMap, ReasoningOracle, SessionId, WorkflowDefinition,
};
use sortie_oracle::{OracleChain, OracleConfig};
use std::path::Path;
use std::sync::Arc;

const BUILTIN_CATALOG: &str = include_str!("../catalog.toml");

/// Registry from a catalog file, or the built-in catalog
pub fn load_registry(path: Option<&Path>) -> Result<ModuleRegistry> {
    let catalog = match path {
        Some(path) => CatalogFile::from_file(path).with_context(|| format!("loading catalog {}", path.display()))?,
        None => CatalogFile::from_toml_str(BUILTIN_CATALOG).context("parsing built-in catalog")?,
    };
    let mut builder = ModuleRegistry::builder();
    builder.register_catalog(catalog)?;
    Ok(builder.build())
}

pub fn load_oracle(path: Option<&Path>) -> Result<Option<Arc<dyn ReasoningOracle>>> {
    let Some(path) = path else {
        return Ok(None);
    };
    let config = OracleConfig::from_file(path).with_context(|| format!("loading oracle config {}", path.display()))?;
    let chain = OracleChain::from_config(&config)?;
    tracing::info!(providers = ?chain.providers(), "oracle chain ready");
    Ok(Some(Arc::new(chain)))
}

/// One line per module
pub fn render_modules(registry: &ModuleRegistry) -> String {
    let mut lines = Vec::new();
    for descriptor in registry.descriptors() {
        let required: Vec<&str> = descriptor.required_parameters().collect();
        let mut line = format!("{:<14} {:?}", descriptor.action, descriptor.concurrency);
        if !descriptor.idempotent {
            line.push_str(" non-idempotent");
        }
        if !required.is_empty() {
            line.push_str(&format!(" [{}]", required.join(", ")));
        }
        if !descriptor.description.is_empty() {
            line.push_str(&format!("  {}", descriptor.description));
        }
        lines.push(line);
    }
    lines.join("\n")
}

pub async fn resolve(
    config: &CoreConfig,
    registry: &ModuleRegistry,
    oracle: Option<Arc<dyn ReasoningOracle>>,
    text: &str,
    offline: bool,
) -> Result<IntentResolution> {
    let oracle = if offline { None } else { oracle };
    let intents = IntentResolver::new(oracle, Arc::new(registry.catalog()), config.intent.clone());
    let resolution = if intents.has_oracle() {
        let summary = KnowledgeStore::new(SessionId::new()).snapshot_context(config.intent.context_items);
        intents.resolve(text, &summary).await?
    } else {
        intents.resolve_offline(text)?
    };
    Ok(resolution)
}

/// Dry-run view of a resolution
#[derive(Debug, Serialize)]
pub struct Plan {
    pub text: String,
    pub source: String,
    pub requires_confirmation: bool,
    pub steps: Vec<PlannedAction>,
    pub follow_ups: Vec<PlannedFollowUp>,
}

#[derive(Debug, Serialize)]
pub struct PlannedAction {
    pub stage: usize,
    pub action: String,
    pub confidence: f64,
    pub parameters: ParameterMap,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub inferred: Vec<FilledParameter>,
    pub status: PlanStatus,
}

#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PlanStatus {
    Ready,
    Blocked { class: ErrorClass, reason: String },
}

#[derive(Debug, Serialize)]
pub struct PlannedFollowUp {
    pub action: String,
    pub when: EntityQuery,
    pub bind: String,
}

impl From<&FollowUp> for PlannedFollowUp {
    fn from(follow_up: &FollowUp) -> Self {
        Self {
            action: follow_up.action.clone(),
            when: follow_up.binding.query.clone(),
            bind: format!("{} <- {}", follow_up.binding.parameter, follow_up.binding.attribute),
        }
    }
}

/// Resolve dependencies against an empty context and check scope, without
/// running anything
pub fn plan(registry: &ModuleRegistry, resolution: &IntentResolution, scope: &AuthorizedScope) -> Plan {
    let snapshot = KnowledgeStore::new(SessionId::new()).snapshot_context(0);
    let mut steps = Vec::new();

    for (index, stage) in resolution.stages.iter().enumerate() {
        for candidate in stage {
            let outcome = registry.lookup(&candidate.action).and_then(|descriptor| {
                let resolved = resolve_with(&descriptor, &candidate.parameters, &snapshot)?;
                let request = ActionRequest::new(resolved.action.clone(), resolved.parameters.clone());
                check_request(scope, &descriptor, &request)?;
                Ok(resolved)
            });

            let step = match outcome {
                Ok(resolved) => PlannedAction {
                    stage: index + 1,
                    action: candidate.action.clone(),
                    confidence: candidate.confidence,
                    inferred: resolved.inferred().cloned().collect(),
                    parameters: resolved.parameters,
                    status: PlanStatus::Ready,
                },
                Err(err) => PlannedAction {
                    stage: index + 1,
                    action: candidate.action.clone(),
                    confidence: candidate.confidence,
                    parameters: candidate.parameters.clone(),
                    inferred: Vec::new(),
                    status: PlanStatus::Blocked {
                        class: err.class(),
                        reason: err.to_string(),
                    },
                },
            };
            steps.push(step);
        }
    }

    Plan {
        text: resolution.text.clone(),
        source: resolution.source.to_string(),
        requires_confirmation: resolution.requires_confirmation,
        steps,
        follow_ups: resolution.follow_ups.iter().map(PlannedFollowUp::from).collect(),
    }
}

/// Load a workflow file and check every action against the registry.
///
/// Required parameters may be missing: the engine fills them from findings
/// at run time.
pub fn check_workflow(registry: &ModuleRegistry, path: &Path) -> Result<WorkflowDefinition> {
    let definition =
        WorkflowDefinition::from_file(path).with_context(|| format!("loading workflow {}", path.display()))?;
    for step in &definition.steps {
        for template in &step.actions {
            let descriptor = registry
                .lookup(&template.action)
                .with_context(|| format!("step '{}'", step.name))?;
            for name in template.parameters.keys() {
                if !descriptor.parameters.contains_key(name) {
                    anyhow::bail!(
                        "step '{}': '{}' has no parameter '{}'",
                        step.name,
                        template.action,
                        name
                    );
                }
            }
        }
    }
    Ok(definition)
}
