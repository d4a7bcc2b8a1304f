//! Oracle answer parsing
//!
//! Oracles wrap JSON in prose and code fences more often than not. The
//! parser digs the first JSON document out of the text, then validates every
//! candidate against the catalog. Anything that does not conform is an
//! `OracleError::Malformed`, which the resolver treats as a failed oracle
//! call.

use regex::Regex;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::OnceLock;

use super::Candidate;
use crate::error::OracleError;
use crate::registry::ActionCatalog;
use crate::types::ParameterMap;

/// A conforming oracle answer
#[derive(Debug, Clone, PartialEq)]
pub enum OracleAnswer {
    /// Candidates to run, grouped into ordered stages
    Plan(Vec<Vec<Candidate>>),

    /// Mutually exclusive readings of the command
    Alternatives(Vec<Candidate>),
}

impl OracleAnswer {
    pub fn is_empty(&self) -> bool {
        match self {
            OracleAnswer::Plan(stages) => stages.iter().all(Vec::is_empty),
            OracleAnswer::Alternatives(alts) => alts.is_empty(),
        }
    }

    /// Flattened candidates in stage order (alternatives best first)
    pub fn into_candidates(self) -> Vec<Candidate> {
        match self {
            OracleAnswer::Plan(stages) => stages.into_iter().flatten().collect(),
            OracleAnswer::Alternatives(mut alts) => {
                alts.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
                alts
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawCandidate {
    #[serde(alias = "module")]
    action: String,
    #[serde(default, alias = "args")]
    parameters: serde_json::Value,
    confidence: serde_json::Value,
    #[serde(default)]
    stage: Option<u32>,
    #[serde(default, alias = "description")]
    rationale: Option<String>,
}

fn fence_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"(?s)```(?:json|JSON)?\s*(.*?)\s*```").ok())
        .as_ref()
}

/// Locate the JSON document inside an oracle reply
pub fn extract_json(text: &str) -> Option<&str> {
    if let Some(captures) = fence_pattern().and_then(|p| p.captures(text)) {
        if let Some(body) = captures.get(1) {
            let body = body.as_str().trim();
            if !body.is_empty() {
                return Some(body);
            }
        }
    }

    let start = text.find(|c| c == '{' || c == '[')?;
    let close = if text[start..].starts_with('{') { '}' } else { ']' };
    let end = text.rfind(close)?;
    (end > start).then(|| &text[start..=end])
}

/// Parse and validate an oracle reply against the action catalog
pub fn parse_response(text: &str, catalog: &ActionCatalog) -> Result<OracleAnswer, OracleError> {
    let json = extract_json(text).ok_or_else(|| OracleError::Malformed("no JSON document in response".into()))?;
    let value: serde_json::Value =
        serde_json::from_str(json).map_err(|e| OracleError::Malformed(format!("invalid JSON: {}", e)))?;

    match value {
        serde_json::Value::Array(items) => plan(items, catalog),
        serde_json::Value::Object(mut map) => {
            if let Some(alternatives) = map.remove("alternatives") {
                let items = as_array(alternatives, "alternatives")?;
                let candidates = items
                    .into_iter()
                    .map(|item| candidate(item, catalog).map(|(c, _)| c))
                    .collect::<Result<Vec<_>, _>>()?;
                return Ok(OracleAnswer::Alternatives(candidates));
            }
            if let Some(actions) = map.remove("actions") {
                return plan(as_array(actions, "actions")?, catalog);
            }
            if map.contains_key("action") || map.contains_key("module") {
                return plan(vec![serde_json::Value::Object(map)], catalog);
            }
            Err(OracleError::Malformed("expected an 'actions' or 'alternatives' list".into()))
        }
        other => Err(OracleError::Malformed(format!("unexpected JSON value: {}", other))),
    }
}

fn as_array(value: serde_json::Value, field: &str) -> Result<Vec<serde_json::Value>, OracleError> {
    match value {
        serde_json::Value::Array(items) => Ok(items),
        _ => Err(OracleError::Malformed(format!("'{}' is not a list", field))),
    }
}

/// Candidates without a stage each get their own, after any explicit ones
fn plan(items: Vec<serde_json::Value>, catalog: &ActionCatalog) -> Result<OracleAnswer, OracleError> {
    let mut staged: BTreeMap<u32, Vec<Candidate>> = BTreeMap::new();
    let mut unstaged = Vec::new();

    for item in items {
        let (candidate, stage) = candidate(item, catalog)?;
        match stage {
            Some(stage) => staged.entry(stage).or_default().push(candidate),
            None => unstaged.push(vec![candidate]),
        }
    }

    let mut stages: Vec<Vec<Candidate>> = staged.into_values().collect();
    stages.extend(unstaged);
    Ok(OracleAnswer::Plan(stages))
}

fn candidate(item: serde_json::Value, catalog: &ActionCatalog) -> Result<(Candidate, Option<u32>), OracleError> {
    let raw: RawCandidate =
        serde_json::from_value(item).map_err(|e| OracleError::Malformed(format!("invalid candidate: {}", e)))?;

    if !catalog.contains(&raw.action) {
        return Err(OracleError::Malformed(format!("unknown action '{}'", raw.action)));
    }

    let parameters: ParameterMap = match raw.parameters {
        serde_json::Value::Null => ParameterMap::new(),
        serde_json::Value::Object(map) => map.into_iter().collect(),
        other => {
            return Err(OracleError::Malformed(format!(
                "parameters of '{}' must be an object, got {}",
                raw.action, other
            )))
        }
    };

    let confidence = raw
        .confidence
        .as_f64()
        .or_else(|| raw.confidence.as_str().and_then(|s| s.trim().parse().ok()))
        .filter(|c| (0.0..=1.0).contains(c))
        .ok_or_else(|| {
            OracleError::Malformed(format!(
                "confidence of '{}' must be a number in [0, 1], got {}",
                raw.action, raw.confidence
            ))
        })?;

    let candidate = Candidate {
        action: raw.action,
        parameters,
        confidence,
        rationale: raw.rationale,
    };
    Ok((candidate, raw.stage))
}
