//! Intent resolution
//!
//! Turns free text plus recent context into candidate action requests. The
//! reasoning oracle is consulted first; when it fails (timeout, rate limit,
//! non-conforming answer) the deterministic rule matcher takes over. Only
//! when both come up empty does resolution fail with `IntentUnresolved`.
//!
//! All oracle-specific prompt construction stays in [`prompt`]; the workflow
//! engine only sees [`IntentResolver::suggest_next`].

pub mod parse;
pub mod prompt;
pub mod rules;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::config::IntentSettings;
use crate::error::{OracleError, OrchestratorError, Result};
use crate::knowledge::{ContextSummary, EntityBinding};
use crate::registry::ActionCatalog;
use crate::types::ParameterMap;

pub use parse::{parse_response, OracleAnswer};
pub use prompt::{OraclePrompt, PromptBuilder, PromptFraming};
pub use rules::RuleMatcher;

/// External natural-language reasoning service
#[async_trait]
pub trait ReasoningOracle: Send + Sync {
    fn name(&self) -> &str;

    /// Raw completion text for a prompt
    async fn complete(&self, prompt: &OraclePrompt) -> std::result::Result<String, OracleError>;
}

/// One proposed module invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub action: String,
    #[serde(default)]
    pub parameters: ParameterMap,
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,
}

impl Candidate {
    pub fn new(action: impl Into<String>, parameters: ParameterMap, confidence: f64) -> Self {
        Self {
            action: action.into(),
            parameters,
            confidence,
            rationale: None,
        }
    }
}

/// "Do this to every matching entity" request deferred until the stages
/// before it have run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FollowUp {
    pub action: String,

    /// Fixed parameters shared by every fanned-out request
    #[serde(default)]
    pub parameters: ParameterMap,

    pub binding: EntityBinding,
    pub confidence: f64,
}

/// Which path produced a resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntentSource {
    Oracle,
    Rules,
}

impl fmt::Display for IntentSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IntentSource::Oracle => f.write_str("oracle"),
            IntentSource::Rules => f.write_str("rules"),
        }
    }
}

/// Outcome of resolving one command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntentResolution {
    pub text: String,

    /// Candidates grouped into ordered stages; a stage runs concurrently
    pub stages: Vec<Vec<Candidate>>,

    /// Deferred steps, run in order after every stage
    #[serde(default)]
    pub follow_ups: Vec<FollowUp>,

    /// Competing interpretations offered by the oracle, best first
    #[serde(default)]
    pub alternatives: Vec<Candidate>,

    pub source: IntentSource,

    /// Advisory: the caller must ask the user before dispatching
    pub requires_confirmation: bool,
}

impl IntentResolution {
    pub fn candidates(&self) -> impl Iterator<Item = &Candidate> {
        self.stages.iter().flatten()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.iter().all(Vec::is_empty) && self.follow_ups.is_empty()
    }

    /// A single action with nothing deferred
    pub fn is_single_action(&self) -> bool {
        self.follow_ups.is_empty() && self.candidates().count() == 1
    }

    pub fn min_confidence(&self) -> Option<f64> {
        self.candidates()
            .map(|c| c.confidence)
            .chain(self.follow_ups.iter().map(|f| f.confidence))
            .reduce(f64::min)
    }
}

/// Resolves free text to candidate action requests
pub struct IntentResolver {
    oracle: Option<Arc<dyn ReasoningOracle>>,
    catalog: Arc<ActionCatalog>,
    settings: IntentSettings,
    rules: RuleMatcher,
}

impl fmt::Debug for IntentResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IntentResolver")
            .field("oracle", &self.oracle.as_ref().map(|o| o.name().to_string()))
            .field("actions", &self.catalog.entries.len())
            .field("settings", &self.settings)
            .finish()
    }
}

impl IntentResolver {
    pub fn new(oracle: Option<Arc<dyn ReasoningOracle>>, catalog: Arc<ActionCatalog>, settings: IntentSettings) -> Self {
        let rules = RuleMatcher::new(catalog.clone());
        Self {
            oracle,
            catalog,
            settings,
            rules,
        }
    }

    pub fn catalog(&self) -> &ActionCatalog {
        &self.catalog
    }

    pub fn settings(&self) -> &IntentSettings {
        &self.settings
    }

    pub fn has_oracle(&self) -> bool {
        self.oracle.is_some()
    }

    /// Resolve a command, oracle first, rules as fallback
    pub async fn resolve(&self, text: &str, summary: &ContextSummary) -> Result<IntentResolution> {
        let text = text.trim();
        if text.is_empty() {
            return Err(OrchestratorError::Validation("empty command".into()));
        }

        let mut failure = match &self.oracle {
            Some(oracle) => match self.ask_oracle(oracle.as_ref(), PromptFraming::Command, text, summary).await {
                Ok(answer) if !answer.is_empty() => {
                    return Ok(self.finish(text, answer, IntentSource::Oracle));
                }
                Ok(_) => "oracle proposed no action".to_string(),
                Err(err) => {
                    tracing::warn!(oracle = oracle.name(), error = %err, "oracle failed, falling back to rule matching");
                    err.to_string()
                }
            },
            None => "no oracle configured".to_string(),
        };

        match self.rules.resolve(text) {
            Some(resolution) => Ok(self.gate(resolution)),
            None => {
                failure.push_str("; no rule matched");
                Err(OrchestratorError::IntentUnresolved {
                    text: text.to_string(),
                    reason: failure,
                })
            }
        }
    }

    /// Rules only, no oracle round trip
    pub fn resolve_offline(&self, text: &str) -> Result<IntentResolution> {
        let text = text.trim();
        self.rules
            .resolve(text)
            .map(|r| self.gate(r))
            .ok_or_else(|| OrchestratorError::IntentUnresolved {
                text: text.to_string(),
                reason: "no rule matched".into(),
            })
    }

    /// Ask the oracle what to do next given the current findings.
    ///
    /// Never falls back to rules: any failure means "no suggestion".
    pub async fn suggest_next(&self, summary: &ContextSummary, goal: Option<&str>) -> Vec<Candidate> {
        let Some(oracle) = &self.oracle else {
            return Vec::new();
        };
        let goal = goal.unwrap_or("continue the assessment");
        match self.ask_oracle(oracle.as_ref(), PromptFraming::SuggestNext, goal, summary).await {
            Ok(answer) => answer.into_candidates(),
            Err(err) => {
                tracing::warn!(oracle = oracle.name(), error = %err, "no next-step suggestion");
                Vec::new()
            }
        }
    }

    async fn ask_oracle(
        &self,
        oracle: &dyn ReasoningOracle,
        framing: PromptFraming,
        text: &str,
        summary: &ContextSummary,
    ) -> std::result::Result<OracleAnswer, OracleError> {
        let prompt = PromptBuilder::new(&self.catalog, &self.settings).build(framing, text, summary);
        let timeout = self.settings.oracle_timeout();

        tracing::debug!(oracle = oracle.name(), ?framing, chars = prompt.len(), "consulting oracle");
        let raw = match tokio::time::timeout(timeout, oracle.complete(&prompt)).await {
            Ok(result) => result?,
            Err(_) => return Err(OracleError::Timeout(timeout.as_millis() as u64)),
        };
        parse_response(&raw, &self.catalog)
    }

    fn finish(&self, text: &str, answer: OracleAnswer, source: IntentSource) -> IntentResolution {
        let resolution = match answer {
            OracleAnswer::Plan(stages) => IntentResolution {
                text: text.to_string(),
                stages,
                follow_ups: Vec::new(),
                alternatives: Vec::new(),
                source,
                requires_confirmation: false,
            },
            OracleAnswer::Alternatives(mut alternatives) => {
                alternatives.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
                let tied = alternatives.len() > 1 && alternatives[0].confidence == alternatives[1].confidence;
                let best = alternatives.first().cloned().into_iter().collect::<Vec<_>>();
                IntentResolution {
                    text: text.to_string(),
                    stages: vec![best],
                    follow_ups: Vec::new(),
                    alternatives,
                    source,
                    requires_confirmation: tied,
                }
            }
        };
        self.gate(resolution)
    }

    /// Flag low-confidence resolutions for confirmation
    fn gate(&self, mut resolution: IntentResolution) -> IntentResolution {
        let low = resolution
            .min_confidence()
            .map_or(false, |c| c < self.settings.confidence_threshold);
        if low {
            tracing::info!(text = %resolution.text, "low-confidence intent, confirmation required");
        }
        resolution.requires_confirmation |= low;
        resolution
    }
}
