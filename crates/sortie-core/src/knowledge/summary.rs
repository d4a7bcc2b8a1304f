//! Bounded context snapshots handed to the resolvers

use serde::{Deserialize, Serialize};

use super::entity::{Entity, EntityKind};
use super::query::EntityQuery;
use crate::action::ResultStatus;
use crate::error::ErrorDetail;
use crate::types::{value_to_text, ParameterMap, RequestId, SessionId, Timestamp};

/// Condensed view of one history record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub request_id: RequestId,
    pub action: String,
    pub parameters: ParameterMap,
    pub status: ResultStatus,
    pub error: Option<ErrorDetail>,
    pub entities_produced: usize,
    pub finished_at: Timestamp,
}

/// Point-in-time, size-bounded view of the knowledge store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextSummary {
    pub session_id: SessionId,

    /// Store revision the snapshot was taken at
    pub revision: u64,

    /// Most recent entities first
    pub entities: Vec<Entity>,

    /// Most recent history entries last
    pub history: Vec<HistoryEntry>,

    /// Most recent utterances last
    pub utterances: Vec<String>,

    pub captured_at: Timestamp,
}

impl ContextSummary {
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty() && self.history.is_empty() && self.utterances.is_empty()
    }

    pub fn entities_of(&self, kind: EntityKind) -> impl Iterator<Item = &Entity> {
        self.entities.iter().filter(move |e| e.kind == kind)
    }

    pub fn matching<'a>(&'a self, query: &'a EntityQuery) -> impl Iterator<Item = &'a Entity> {
        self.entities.iter().filter(move |e| query.matches(e))
    }

    /// Render the snapshot as prompt text, never exceeding `max_chars`.
    ///
    /// Sections are written in priority order (entities, then history, then
    /// utterances) and each line is dropped whole rather than cut.
    pub fn render(&self, max_chars: usize) -> String {
        let mut out = String::new();
        let mut push = |line: String, out: &mut String| -> bool {
            if out.len() + line.len() + 1 > max_chars {
                return false;
            }
            out.push_str(&line);
            out.push('\n');
            true
        };

        if !self.entities.is_empty() && push("Known entities:".to_string(), &mut out) {
            for entity in &self.entities {
                if !push(format!("- {}", entity.summary_line()), &mut out) {
                    break;
                }
            }
        }

        if !self.history.is_empty() && push("Recent actions:".to_string(), &mut out) {
            for entry in self.history.iter().rev() {
                let params: Vec<String> = entry
                    .parameters
                    .iter()
                    .map(|(k, v)| format!("{}={}", k, value_to_text(v)))
                    .collect();
                let line = format!(
                    "- {} {} -> {} ({} entities)",
                    entry.action,
                    params.join(" "),
                    entry.status,
                    entry.entities_produced
                );
                if !push(line, &mut out) {
                    break;
                }
            }
        }

        if !self.utterances.is_empty() && push("Recent commands:".to_string(), &mut out) {
            for text in self.utterances.iter().rev() {
                if !push(format!("- {}", text), &mut out) {
                    break;
                }
            }
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::now;

    fn summary() -> ContextSummary {
        ContextSummary {
            session_id: SessionId::new(),
            revision: 3,
            entities: (0..50)
                .map(|i| Entity::host(format!("10.0.0.{}", i)).with_tag("http"))
                .collect(),
            history: Vec::new(),
            utterances: vec!["scan 10.0.0.0/24".into()],
            captured_at: now(),
        }
    }

    #[test]
    fn render_respects_budget() {
        let text = summary().render(200);
        assert!(text.len() <= 200);
        assert!(text.starts_with("Known entities:"));
        assert!(text.contains("host 10.0.0.0 [http]"));
    }

    #[test]
    fn render_includes_all_sections_when_room() {
        let mut s = summary();
        s.entities.truncate(1);
        let text = s.render(10_000);
        assert!(text.contains("Recent commands:"));
        assert!(text.contains("scan 10.0.0.0/24"));
    }
}
