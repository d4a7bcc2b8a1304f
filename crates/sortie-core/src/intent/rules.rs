//! Deterministic rule matcher
//!
//! The fallback when the oracle is unavailable. Commands are split into
//! clauses on sequencing words, each clause is matched against a fixed verb
//! vocabulary and its targets are pulled out by shape (URL, IP, CIDR, host
//! name). A clause like "scan any discovered web server" becomes a
//! [`FollowUp`] bound to entities found by earlier stages.

use regex::Regex;
use std::net::IpAddr;
use std::sync::{Arc, OnceLock};

use super::{Candidate, FollowUp, IntentResolution, IntentSource};
use crate::knowledge::{EntityBinding, EntityKind, EntityQuery};
use crate::policy::Network;
use crate::registry::{ActionCatalog, CatalogEntry};
use crate::types::ParameterMap;

/// Confidence of a rule match with explicit targets
const EXPLICIT: f64 = 1.0;

/// Confidence of a rule match that relies on dependency resolution, or of
/// a command where some clause matched nothing
const PARTIAL: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verb {
    PortScan,
    WebScan,
    BruteForce,
    Exploit,
    Enumerate,
    Scan,
}

impl Verb {
    /// Longest phrases first so "port scan" wins over "scan"
    const VOCABULARY: &'static [(&'static str, Verb)] = &[
        ("port scan", Verb::PortScan),
        ("port-scan", Verb::PortScan),
        ("portscan", Verb::PortScan),
        ("web scan", Verb::WebScan),
        ("web-scan", Verb::WebScan),
        ("webscan", Verb::WebScan),
        ("brute force", Verb::BruteForce),
        ("brute-force", Verb::BruteForce),
        ("bruteforce", Verb::BruteForce),
        ("exploit", Verb::Exploit),
        ("enumerate", Verb::Enumerate),
        ("scan", Verb::Scan),
    ];

    /// (preferred action id, capability) pairs tried in order
    fn actions(self) -> &'static [(&'static str, &'static str)] {
        match self {
            Verb::PortScan => &[("port_scan", "port_scan"), ("scan", "network")],
            Verb::WebScan => &[("web_scan", "web")],
            Verb::BruteForce => &[("brute_force", "brute_force")],
            Verb::Exploit => &[("exploit", "exploit")],
            Verb::Enumerate => &[("enumerate", "enumeration")],
            Verb::Scan => &[("scan", "network")],
        }
    }

    fn is_scan(self) -> bool {
        matches!(self, Verb::Scan | Verb::PortScan | Verb::WebScan)
    }
}

/// What "any discovered <noun>" refers to
struct Noun {
    words: &'static [&'static str],
    kind: EntityKind,
    tag: Option<&'static str>,
    attribute: &'static str,
    web: bool,
}

const NOUNS: &[Noun] = &[
    Noun {
        words: &["web server", "web servers", "web service", "web services", "http server", "http servers", "website", "websites", "web app", "web apps"],
        kind: EntityKind::Host,
        tag: Some("http"),
        attribute: "address",
        web: true,
    },
    Noun {
        words: &["ssh server", "ssh servers", "ssh service", "ssh services"],
        kind: EntityKind::Service,
        tag: Some("ssh"),
        attribute: "host",
        web: false,
    },
    Noun {
        words: &["host", "hosts", "machine", "machines", "server", "servers"],
        kind: EntityKind::Host,
        tag: None,
        attribute: "address",
        web: false,
    },
    Noun {
        words: &["service", "services", "port", "ports"],
        kind: EntityKind::Service,
        tag: None,
        attribute: "host",
        web: false,
    },
    Noun {
        words: &["vulnerability", "vulnerabilities", "vuln", "vulns"],
        kind: EntityKind::Vulnerability,
        tag: None,
        attribute: "host",
        web: false,
    },
];

const FILLERS: &[&str] = &["please", "now", "also", "and", "next", "then", "finally"];

fn pattern(cell: &'static OnceLock<Option<Regex>>, source: &str) -> Option<&'static Regex> {
    cell.get_or_init(|| Regex::new(source).ok()).as_ref()
}

fn clause_separator() -> Option<&'static Regex> {
    static CELL: OnceLock<Option<Regex>> = OnceLock::new();
    pattern(&CELL, r"(?i)\s*(?:;|,?\s+and\s+then\s+|,?\s+then\s+|,?\s+after\s+that\s+|,?\s+afterwards\s+)\s*")
}

fn follow_up_phrase() -> Option<&'static Regex> {
    static CELL: OnceLock<Option<Regex>> = OnceLock::new();
    pattern(
        &CELL,
        r"^(?:(?:on|against|to|for)\s+)?(?:(?:any|all|every|each|the)\s+)?(?:(?:newly|other)\s+)?(?:discovered|found|identified|detected|live|open)\s+(?P<noun>[a-z][a-z ]*?)\s*$|^(?:(?:on|against|to|for)\s+)?(?:any|all|every|each)\s+(?P<noun2>[a-z][a-z ]*?)\s*$",
    )
}

fn port_option() -> Option<&'static Regex> {
    static CELL: OnceLock<Option<Regex>> = OnceLock::new();
    pattern(&CELL, r"(?i)(?:-p\s*|\bports?\s+)(?P<ports>\d{1,5}(?:\s*[,-]\s*\d{1,5})*)")
}

fn host_name() -> Option<&'static Regex> {
    static CELL: OnceLock<Option<Regex>> = OnceLock::new();
    pattern(
        &CELL,
        r"(?i)^[a-z0-9](?:[a-z0-9-]{0,61}[a-z0-9])?(?:\.[a-z0-9](?:[a-z0-9-]{0,61}[a-z0-9])?)*\.[a-z]{2,63}$",
    )
}

enum ClauseMatch {
    Actions(Vec<Candidate>),
    FollowUp(FollowUp),
}

/// Rule-based intent matcher over a fixed verb vocabulary
#[derive(Debug, Clone)]
pub struct RuleMatcher {
    catalog: Arc<ActionCatalog>,
}

impl RuleMatcher {
    pub fn new(catalog: Arc<ActionCatalog>) -> Self {
        Self { catalog }
    }

    /// Match a whole command; `None` when no clause matched anything
    pub fn resolve(&self, text: &str) -> Option<IntentResolution> {
        let mut stages = Vec::new();
        let mut follow_ups = Vec::new();
        let mut unmatched = 0usize;

        for clause in split_clauses(text) {
            match self.match_clause(&clause) {
                Some(ClauseMatch::Actions(candidates)) => stages.push(candidates),
                Some(ClauseMatch::FollowUp(follow_up)) => follow_ups.push(follow_up),
                None => {
                    tracing::debug!(clause = %clause, "no rule matched clause");
                    unmatched += 1;
                }
            }
        }

        if stages.is_empty() && follow_ups.is_empty() {
            return None;
        }

        if unmatched > 0 {
            for candidate in stages.iter_mut().flatten() {
                candidate.confidence = candidate.confidence.min(PARTIAL);
            }
            for follow_up in &mut follow_ups {
                follow_up.confidence = follow_up.confidence.min(PARTIAL);
            }
        }

        Some(IntentResolution {
            text: text.to_string(),
            stages,
            follow_ups,
            alternatives: Vec::new(),
            source: IntentSource::Rules,
            requires_confirmation: false,
        })
    }

    fn match_clause(&self, clause: &str) -> Option<ClauseMatch> {
        let lowered = clause.to_ascii_lowercase();
        let (verb, rest_start) = find_verb(&lowered)?;
        let original_rest = clause.get(rest_start..).unwrap_or("").trim();
        let lowered_rest = lowered.get(rest_start..).unwrap_or("").trim();

        if let Some(follow_up) = self.follow_up(verb, lowered_rest) {
            return Some(ClauseMatch::FollowUp(follow_up));
        }

        let targets = extract_targets(original_rest);
        let ports = port_option()
            .and_then(|p| p.captures(original_rest))
            .and_then(|c| c.name("ports"))
            .map(|m| m.as_str().split_whitespace().collect::<String>());

        let mut candidates = Vec::new();
        if targets.is_empty() {
            let entry = self.action_for(verb)?;
            let mut parameters = ParameterMap::new();
            apply_ports(entry, ports.as_deref(), &mut parameters);
            candidates.push(Candidate::new(entry.action.clone(), parameters, PARTIAL));
        } else {
            for target in targets {
                let entry = match target {
                    Target::Url(_) if verb.is_scan() => self.web_action().or_else(|| self.action_for(verb)),
                    _ => self.action_for(verb),
                }?;
                let mut parameters = ParameterMap::new();
                let param = entry.target_parameter.clone().unwrap_or_else(|| "target".to_string());
                parameters.insert(param, serde_json::Value::String(target.as_str().to_string()));
                apply_ports(entry, ports.as_deref(), &mut parameters);
                candidates.push(Candidate::new(entry.action.clone(), parameters, EXPLICIT));
            }
        }
        Some(ClauseMatch::Actions(candidates))
    }

    fn follow_up(&self, verb: Verb, rest: &str) -> Option<FollowUp> {
        let captures = follow_up_phrase()?.captures(rest)?;
        let noun_text = captures.name("noun").or_else(|| captures.name("noun2"))?.as_str().trim();
        let noun = NOUNS.iter().find(|n| n.words.contains(&noun_text))?;

        let entry = if noun.web && verb.is_scan() {
            self.web_action().or_else(|| self.action_for(verb))
        } else {
            self.action_for(verb)
        }?;

        let mut query = EntityQuery::of(noun.kind);
        if let Some(tag) = noun.tag {
            query = query.with_tag(tag);
        }
        let parameter = entry.target_parameter.clone().unwrap_or_else(|| "target".to_string());

        Some(FollowUp {
            action: entry.action.clone(),
            parameters: ParameterMap::new(),
            binding: EntityBinding::new(query, parameter, noun.attribute),
            confidence: EXPLICIT,
        })
    }

    fn action_for(&self, verb: Verb) -> Option<&CatalogEntry> {
        verb.actions()
            .iter()
            .find_map(|(preferred, capability)| self.catalog.find(preferred, capability))
    }

    fn web_action(&self) -> Option<&CatalogEntry> {
        self.action_for(Verb::WebScan)
    }
}

fn split_clauses(text: &str) -> Vec<String> {
    let clauses: Vec<String> = match clause_separator() {
        Some(separator) => separator.split(text).map(str::to_string).collect(),
        None => vec![text.to_string()],
    };
    clauses
        .into_iter()
        .map(|c| c.trim().trim_end_matches(['.', '!', ',']).trim().to_string())
        .filter(|c| !c.is_empty())
        .collect()
}

/// The verb at the start of a clause (after filler words) and the byte
/// offset where its arguments begin
fn find_verb(lowered: &str) -> Option<(Verb, usize)> {
    let mut offset = lowered.len() - lowered.trim_start().len();
    loop {
        let rest = &lowered[offset..];
        let filler = FILLERS.iter().find(|f| {
            rest.strip_prefix(**f)
                .map_or(false, |after| after.starts_with(char::is_whitespace))
        });
        match filler {
            Some(f) => {
                let after = &rest[f.len()..];
                offset += f.len() + (after.len() - after.trim_start().len());
            }
            None => break,
        }
    }

    let rest = &lowered[offset..];
    Verb::VOCABULARY.iter().find_map(|(phrase, verb)| {
        let after = rest.strip_prefix(phrase)?;
        let boundary = after.is_empty() || after.starts_with(|c: char| c.is_whitespace() || c == ',');
        boundary.then(|| (*verb, offset + phrase.len()))
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Target {
    Url(String),
    Address(String),
    Host(String),
}

impl Target {
    fn as_str(&self) -> &str {
        match self {
            Target::Url(s) | Target::Address(s) | Target::Host(s) => s,
        }
    }
}

fn extract_targets(text: &str) -> Vec<Target> {
    let mut targets: Vec<Target> = Vec::new();
    for token in text.split(|c: char| c.is_whitespace() || c == ',') {
        let token = token.trim_matches(|c: char| matches!(c, '"' | '\'' | '(' | ')' | ';')).trim_end_matches('.');
        if token.is_empty() {
            continue;
        }

        let lowered = token.to_ascii_lowercase();
        let target = if lowered.starts_with("http://") || lowered.starts_with("https://") {
            url::Url::parse(token).ok().map(|_| Target::Url(token.to_string()))
        } else if token.parse::<Network>().is_ok() || token.parse::<IpAddr>().is_ok() {
            Some(Target::Address(token.to_string()))
        } else if host_name().map_or(false, |p| p.is_match(token)) {
            Some(Target::Host(lowered))
        } else {
            None
        };

        if let Some(target) = target {
            if !targets.contains(&target) {
                targets.push(target);
            }
        }
    }
    targets
}

fn apply_ports(entry: &CatalogEntry, ports: Option<&str>, parameters: &mut ParameterMap) {
    let Some(ports) = ports else {
        return;
    };
    let declares = |name: &str| entry.required.iter().chain(&entry.optional).any(|p| p == name);

    if declares("ports") {
        parameters.insert("ports".into(), serde_json::Value::String(ports.to_string()));
    } else if declares("port") {
        if let Ok(port) = ports.parse::<u16>() {
            parameters.insert("port".into(), serde_json::Value::from(port));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(action: &str, capability: &str, optional: &[&str]) -> CatalogEntry {
        CatalogEntry {
            action: action.into(),
            description: String::new(),
            required: vec!["target".into()],
            optional: optional.iter().map(|s| s.to_string()).collect(),
            capabilities: vec![capability.into()],
            target_parameter: Some("target".into()),
        }
    }

    fn matcher() -> RuleMatcher {
        RuleMatcher::new(Arc::new(ActionCatalog {
            entries: vec![
                entry("scan", "network", &["ports"]),
                entry("web_scan", "web", &[]),
                entry("ssh_bruteforce", "brute_force", &["port"]),
            ],
        }))
    }

    #[test]
    fn scan_then_follow_up_on_web_servers() {
        let resolution = matcher()
            .resolve("scan 10.0.0.0/24 then scan any discovered web server")
            .unwrap();

        assert_eq!(resolution.source, IntentSource::Rules);
        assert_eq!(resolution.stages.len(), 1);
        let first = &resolution.stages[0][0];
        assert_eq!(first.action, "scan");
        assert_eq!(first.parameters["target"], json!("10.0.0.0/24"));
        assert_eq!(first.confidence, EXPLICIT);

        assert_eq!(resolution.follow_ups.len(), 1);
        let follow_up = &resolution.follow_ups[0];
        assert_eq!(follow_up.action, "web_scan");
        assert_eq!(follow_up.binding.parameter, "target");
        assert_eq!(follow_up.binding.attribute, "address");
        assert_eq!(follow_up.binding.query, EntityQuery::of(EntityKind::Host).with_tag("http"));
    }

    #[test]
    fn url_targets_go_to_the_web_scanner() {
        let resolution = matcher().resolve("Scan https://app.internal/login").unwrap();
        let candidate = &resolution.stages[0][0];
        assert_eq!(candidate.action, "web_scan");
        assert_eq!(candidate.parameters["target"], json!("https://app.internal/login"));
    }

    #[test]
    fn several_targets_share_a_stage() {
        let resolution = matcher().resolve("please scan 10.0.0.5 and 10.0.0.6, db.corp.example").unwrap();
        assert_eq!(resolution.stages.len(), 1);
        let targets: Vec<&serde_json::Value> = resolution.stages[0].iter().map(|c| &c.parameters["target"]).collect();
        assert_eq!(targets, vec![&json!("10.0.0.5"), &json!("10.0.0.6"), &json!("db.corp.example")]);
    }

    #[test]
    fn capability_lookup_and_port_options() {
        let resolution = matcher().resolve("brute force 10.0.0.5 port 2222; port scan 10.0.0.6 -p 22,80").unwrap();
        assert_eq!(resolution.stages.len(), 2);

        let brute = &resolution.stages[0][0];
        assert_eq!(brute.action, "ssh_bruteforce");
        assert_eq!(brute.parameters["port"], json!(2222));

        let scan = &resolution.stages[1][0];
        assert_eq!(scan.action, "scan");
        assert_eq!(scan.parameters["ports"], json!("22,80"));
    }

    #[test]
    fn verb_without_target_needs_confirmation_level_confidence() {
        let resolution = matcher().resolve("brute force any discovered ssh servers").unwrap();
        assert_eq!(resolution.follow_ups[0].action, "ssh_bruteforce");
        assert_eq!(resolution.follow_ups[0].binding.attribute, "host");

        let resolution = matcher().resolve("web scan").unwrap();
        assert_eq!(resolution.stages[0][0].confidence, PARTIAL);
        assert!(resolution.stages[0][0].parameters.is_empty());
    }

    #[test]
    fn unmatched_clause_lowers_confidence() {
        let resolution = matcher().resolve("scan 10.0.0.5 then make coffee").unwrap();
        assert_eq!(resolution.stages[0][0].confidence, PARTIAL);
    }

    #[test]
    fn unknown_commands_and_missing_actions_yield_nothing() {
        assert!(matcher().resolve("make me a sandwich").is_none());
        assert!(matcher().resolve("exploit 10.0.0.5").is_none());
        assert!(matcher().resolve("scanner 10.0.0.5").is_none());
    }
}
