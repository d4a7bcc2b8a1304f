//! Oracle prompt construction

use serde::{Deserialize, Serialize};

use crate::config::IntentSettings;
use crate::knowledge::ContextSummary;
use crate::registry::ActionCatalog;

const COMMAND_FRAMING: &str = "You translate security assessment commands into module invocations. \
Only use actions from the list below and only the parameters they declare. \
Respond with JSON only: {\"actions\": [{\"action\": string, \"parameters\": object, \"confidence\": number between 0 and 1, \"stage\": integer}]}. \
Actions sharing a stage run concurrently; stages run in ascending order. \
If the command has several plausible readings, respond with {\"alternatives\": [...]} instead, one entry per reading.";

const SUGGEST_FRAMING: &str = "You plan the next step of an authorized security assessment. \
Given the findings so far, propose the next module invocations from the list below. \
Respond with JSON only: {\"actions\": [{\"action\": string, \"parameters\": object, \"confidence\": number between 0 and 1}]}. \
Respond with {\"actions\": []} when the assessment goal is met or nothing useful remains.";

/// Which question the oracle is asked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptFraming {
    /// Translate a user command
    Command,
    /// Propose what to do after a workflow step
    SuggestNext,
}

/// Request sent to a reasoning oracle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OraclePrompt {
    pub framing: PromptFraming,
    pub system: String,
    pub user: String,

    /// JSON schema of the expected answer, for providers with structured output
    pub schema: Option<serde_json::Value>,
}

impl OraclePrompt {
    pub fn len(&self) -> usize {
        self.system.len() + self.user.len()
    }

    pub fn is_empty(&self) -> bool {
        self.system.is_empty() && self.user.is_empty()
    }

    /// Single-string form for completion-style endpoints
    pub fn render(&self) -> String {
        format!("{}\n\n{}", self.system, self.user)
    }
}

/// Builds bounded prompts from a catalog and a context snapshot
#[derive(Debug)]
pub struct PromptBuilder<'a> {
    catalog: &'a ActionCatalog,
    settings: &'a IntentSettings,
}

impl<'a> PromptBuilder<'a> {
    pub fn new(catalog: &'a ActionCatalog, settings: &'a IntentSettings) -> Self {
        Self { catalog, settings }
    }

    /// Build a prompt no longer than `max_prompt_chars`.
    ///
    /// The framing, catalog and user text are kept whole; the context summary
    /// gets whatever budget remains.
    pub fn build(&self, framing: PromptFraming, text: &str, summary: &ContextSummary) -> OraclePrompt {
        let max = self.settings.max_prompt_chars;
        let framing_text = match framing {
            PromptFraming::Command => COMMAND_FRAMING,
            PromptFraming::SuggestNext => SUGGEST_FRAMING,
        };
        let system = truncate(
            &format!("{}\n\nAvailable actions:\n{}", framing_text, self.catalog.render()),
            max,
        );

        let request = match framing {
            PromptFraming::Command => format!("User command: {}", text),
            PromptFraming::SuggestNext => format!("Goal: {}", text),
        };
        let request = truncate(&request, max.saturating_sub(system.len() + 2));

        let budget = max.saturating_sub(system.len() + request.len() + 4);
        let context = bounded(summary, self.settings).render(budget);

        let user = if context.is_empty() {
            request
        } else {
            format!("{}\n{}", context, request)
        };

        OraclePrompt {
            framing,
            system,
            user,
            schema: Some(answer_schema()),
        }
    }
}

/// The snapshot cut down to the configured item counts
fn bounded(summary: &ContextSummary, settings: &IntentSettings) -> ContextSummary {
    let mut summary = summary.clone();
    summary.entities.truncate(settings.context_items);
    let skip = summary.history.len().saturating_sub(settings.context_items);
    summary.history.drain(..skip);
    let skip = summary.utterances.len().saturating_sub(settings.recent_commands);
    summary.utterances.drain(..skip);
    summary
}

fn truncate(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut end = max;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    text[..end].to_string()
}

fn answer_schema() -> serde_json::Value {
    let candidate = serde_json::json!({
        "type": "object",
        "required": ["action", "parameters", "confidence"],
        "properties": {
            "action": {"type": "string"},
            "parameters": {"type": "object"},
            "confidence": {"type": "number", "minimum": 0, "maximum": 1},
            "stage": {"type": "integer", "minimum": 0}
        }
    });
    serde_json::json!({
        "type": "object",
        "properties": {
            "actions": {"type": "array", "items": candidate.clone()},
            "alternatives": {"type": "array", "items": candidate}
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::knowledge::{Entity, KnowledgeStore};
    use crate::registry::{CatalogEntry, ActionCatalog};
    use crate::types::SessionId;

    fn catalog() -> ActionCatalog {
        ActionCatalog {
            entries: vec![CatalogEntry {
                action: "scan".into(),
                description: "Host discovery".into(),
                required: vec!["target".into()],
                optional: vec![],
                capabilities: vec!["network".into()],
                target_parameter: Some("target".into()),
            }],
        }
    }

    fn busy_summary() -> ContextSummary {
        let store = KnowledgeStore::new(SessionId::new());
        for i in 0..200 {
            store
                .upsert_entity(Entity::host(format!("10.0.{}.{}", i / 250, i % 250)).with_attribute("os", "linux"))
                .unwrap();
        }
        for i in 0..10 {
            store.record_utterance(format!("command {}", i)).unwrap();
        }
        store.snapshot_context(500)
    }

    #[test]
    fn prompt_is_bounded() {
        let settings = IntentSettings {
            max_prompt_chars: 1500,
            ..IntentSettings::default()
        };
        let catalog = catalog();
        let prompt = PromptBuilder::new(&catalog, &settings).build(PromptFraming::Command, "scan 10.0.0.5", &busy_summary());

        assert!(prompt.len() <= 1500);
        assert!(prompt.system.contains("- scan (required: target)"));
        assert!(prompt.user.ends_with("User command: scan 10.0.0.5"));
    }

    #[test]
    fn only_recent_commands_are_included() {
        let settings = IntentSettings::default();
        let catalog = catalog();
        let prompt = PromptBuilder::new(&catalog, &settings).build(PromptFraming::Command, "scan", &busy_summary());

        assert!(prompt.user.contains("command 9"));
        assert!(prompt.user.contains("command 5"));
        assert!(!prompt.user.contains("command 4"));
        assert_eq!(prompt.user.matches("- host ").count(), settings.context_items);
    }

    #[test]
    fn suggest_framing_states_the_goal() {
        let settings = IntentSettings::default();
        let catalog = catalog();
        let summary = KnowledgeStore::new(SessionId::new()).snapshot_context(4);
        let prompt = PromptBuilder::new(&catalog, &settings).build(PromptFraming::SuggestNext, "find web servers", &summary);

        assert_eq!(prompt.user, "Goal: find web servers");
        assert!(prompt.render().contains("next step"));
    }
}
