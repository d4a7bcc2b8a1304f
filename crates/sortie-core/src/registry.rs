//! Module registry
//!
//! Maps action identifiers to module descriptors (and, when the module body
//! is linked in, to its executor). Built once at startup through
//! [`ModuleRegistryBuilder`]; [`ModuleRegistryBuilder::build`] freezes it into
//! an immutable [`ModuleRegistry`] that is shared by `Arc` and read without
//! any locking.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{OrchestratorError, Result, ResultExt};
use crate::knowledge::{AttributeFilter, EntityKind};
use crate::module::AssessmentModule;

/// Declared type of a module parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterKind {
    /// Host name, IP address or CIDR network. Scope-checked.
    Target,
    /// Absolute URL. Scope-checked by host.
    Url,
    Port,
    Integer,
    Boolean,
    Text,
    /// A path or a list of candidate words
    Wordlist,
}

impl ParameterKind {
    /// Whether values of this kind name something the scope policy must approve
    pub fn is_target(self) -> bool {
        matches!(self, ParameterKind::Target | ParameterKind::Url)
    }

    /// Check a value against the kind and return its canonical form.
    ///
    /// Numeric strings are accepted for ports and integers because oracles
    /// routinely quote them.
    pub fn normalize(self, value: &serde_json::Value) -> Option<serde_json::Value> {
        use serde_json::Value;

        match self {
            ParameterKind::Target | ParameterKind::Text => match value {
                Value::String(s) if !s.trim().is_empty() => Some(Value::String(s.trim().to_string())),
                _ => None,
            },
            ParameterKind::Url => value
                .as_str()
                .and_then(|s| url::Url::parse(s.trim()).ok())
                .filter(|u| u.host_str().is_some())
                .map(|u| Value::String(u.to_string())),
            ParameterKind::Port => {
                let port = match value {
                    Value::Number(n) => n.as_u64(),
                    Value::String(s) => s.trim().parse::<u64>().ok(),
                    _ => None,
                }?;
                (1..=u64::from(u16::MAX)).contains(&port).then(|| Value::from(port))
            }
            ParameterKind::Integer => match value {
                Value::Number(n) => n.as_i64().map(Value::from),
                Value::String(s) => s.trim().parse::<i64>().ok().map(Value::from),
                _ => None,
            },
            ParameterKind::Boolean => match value {
                Value::Bool(b) => Some(Value::Bool(*b)),
                Value::String(s) => s.trim().parse::<bool>().ok().map(Value::Bool),
                _ => None,
            },
            ParameterKind::Wordlist => match value {
                Value::String(s) if !s.trim().is_empty() => Some(value.clone()),
                Value::Array(items) if items.iter().all(Value::is_string) => Some(value.clone()),
                _ => None,
            },
        }
    }
}

impl fmt::Display for ParameterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ParameterKind::Target => "target",
            ParameterKind::Url => "url",
            ParameterKind::Port => "port",
            ParameterKind::Integer => "integer",
            ParameterKind::Boolean => "boolean",
            ParameterKind::Text => "text",
            ParameterKind::Wordlist => "wordlist",
        };
        f.write_str(label)
    }
}

/// Where the dependency resolver may look for a missing value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntitySource {
    pub kind: EntityKind,

    /// Attribute holding the value; `None` means the identity key
    #[serde(default)]
    pub attribute: Option<String>,

    /// Extra restriction on eligible entities
    #[serde(default)]
    pub filter: AttributeFilter,
}

impl EntitySource {
    pub fn new(kind: EntityKind) -> Self {
        Self {
            kind,
            attribute: None,
            filter: AttributeFilter::any(),
        }
    }

    pub fn attribute(mut self, name: impl Into<String>) -> Self {
        self.attribute = Some(name.into());
        self
    }

    pub fn filter(mut self, filter: AttributeFilter) -> Self {
        self.filter = filter;
        self
    }

    /// Attribute name used when reading the value
    pub fn attribute_name(&self) -> &str {
        self.attribute.as_deref().unwrap_or("identity_key")
    }
}

/// Schema entry of one parameter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSpec {
    #[serde(default)]
    pub required: bool,
    pub kind: ParameterKind,
    #[serde(default)]
    pub default: Option<serde_json::Value>,
    #[serde(default)]
    pub source: Option<EntitySource>,
    #[serde(default)]
    pub description: Option<String>,
}

impl ParameterSpec {
    pub fn required(kind: ParameterKind) -> Self {
        Self {
            required: true,
            kind,
            default: None,
            source: None,
            description: None,
        }
    }

    pub fn optional(kind: ParameterKind) -> Self {
        Self {
            required: false,
            ..Self::required(kind)
        }
    }

    pub fn with_default(mut self, value: impl Into<serde_json::Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    pub fn from_entities(mut self, source: EntitySource) -> Self {
        self.source = Some(source);
        self
    }

    pub fn describe(mut self, text: impl Into<String>) -> Self {
        self.description = Some(text.into());
        self
    }
}

/// Sharing policy governing scheduler slot allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConcurrencyClass {
    /// At most one running instance per module
    Exclusive,
    /// Draws from the scheduler's shared pool
    #[default]
    SharedLimited,
    Unlimited,
}

fn default_true() -> bool {
    true
}

/// Upper bound on a declared duration hint (one week)
pub const MAX_DURATION_HINT_SECS: u64 = 7 * 24 * 60 * 60;

/// Registry entry: everything the core knows about a module
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleDescriptor {
    pub action: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub parameters: BTreeMap<String, ParameterSpec>,
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
    #[serde(default)]
    pub concurrency: ConcurrencyClass,

    /// Average run time; the scheduler derives the timeout from it
    #[serde(default)]
    pub duration_hint_secs: Option<u64>,

    /// Non-idempotent modules are not retried after a timeout
    #[serde(default = "default_true")]
    pub idempotent: bool,
}

impl ModuleDescriptor {
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            description: String::new(),
            parameters: BTreeMap::new(),
            capabilities: BTreeSet::new(),
            concurrency: ConcurrencyClass::default(),
            duration_hint_secs: None,
            idempotent: true,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_parameter(mut self, name: impl Into<String>, spec: ParameterSpec) -> Self {
        self.parameters.insert(name.into(), spec);
        self
    }

    pub fn with_capability(mut self, tag: impl Into<String>) -> Self {
        self.capabilities.insert(tag.into());
        self
    }

    pub fn with_concurrency(mut self, class: ConcurrencyClass) -> Self {
        self.concurrency = class;
        self
    }

    pub fn with_duration_hint(mut self, hint: Duration) -> Self {
        self.duration_hint_secs = Some(hint.as_secs().clamp(1, MAX_DURATION_HINT_SECS));
        self
    }

    pub fn non_idempotent(mut self) -> Self {
        self.idempotent = false;
        self
    }

    pub fn duration_hint(&self, fallback: Duration) -> Duration {
        self.duration_hint_secs.map(Duration::from_secs).unwrap_or(fallback)
    }

    pub fn parameter(&self, name: &str) -> Option<&ParameterSpec> {
        self.parameters.get(name)
    }

    pub fn required_parameters(&self) -> impl Iterator<Item = &str> {
        self.parameters
            .iter()
            .filter(|(_, spec)| spec.required)
            .map(|(name, _)| name.as_str())
    }

    /// The parameter that receives the command's target, if any:
    /// the first required target/url parameter, else the first optional one
    pub fn target_parameter(&self) -> Option<&str> {
        let mut targets = self.parameters.iter().filter(|(_, spec)| spec.kind.is_target());
        let first_required = targets.clone().find(|(_, spec)| spec.required);
        first_required.or_else(|| targets.next()).map(|(name, _)| name.as_str())
    }

    pub fn has_capability(&self, tag: &str) -> bool {
        self.capabilities.iter().any(|c| c.eq_ignore_ascii_case(tag))
    }

    /// Structural checks applied at registration
    pub fn validate(&self) -> Result<()> {
        let action = self.action.trim();
        if action.is_empty() || action.chars().any(char::is_whitespace) {
            return Err(OrchestratorError::Validation(format!(
                "invalid action identifier '{}'",
                self.action
            )));
        }
        if let Some(secs) = self.duration_hint_secs {
            if secs == 0 || secs > MAX_DURATION_HINT_SECS {
                return Err(OrchestratorError::Validation(format!(
                    "action '{}': duration_hint_secs must be within 1..={}",
                    self.action, MAX_DURATION_HINT_SECS
                )));
            }
        }
        for (name, spec) in &self.parameters {
            if let Some(default) = &spec.default {
                if spec.kind.normalize(default).is_none() {
                    return Err(OrchestratorError::Validation(format!(
                        "action '{}': default for '{}' is not a valid {}",
                        self.action, name, spec.kind
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Catalog file layout: a list of `[[module]]` tables
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CatalogFile {
    #[serde(default, rename = "module")]
    pub modules: Vec<ModuleDescriptor>,
}

impl CatalogFile {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| OrchestratorError::Config(format!("invalid catalog: {}", e)))
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(OrchestratorError::from)
            .with_context(|| format!("reading catalog {}", path.display()))?;
        Self::from_toml_str(&text)
    }
}

/// Plain-data view of one registry entry, used in prompts and by the rule matcher
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub action: String,
    pub description: String,
    pub required: Vec<String>,
    pub optional: Vec<String>,
    pub capabilities: Vec<String>,
    pub target_parameter: Option<String>,
}

/// The set of actions the intent resolver may propose
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionCatalog {
    pub entries: Vec<CatalogEntry>,
}

impl ActionCatalog {
    pub fn get(&self, action: &str) -> Option<&CatalogEntry> {
        self.entries.iter().find(|e| e.action == action)
    }

    pub fn contains(&self, action: &str) -> bool {
        self.get(action).is_some()
    }

    /// An action named exactly `preferred`, else the first one carrying `capability`
    pub fn find(&self, preferred: &str, capability: &str) -> Option<&CatalogEntry> {
        self.get(preferred).or_else(|| {
            self.entries
                .iter()
                .find(|e| e.capabilities.iter().any(|c| c.eq_ignore_ascii_case(capability)))
        })
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// One line per action, for prompts
    pub fn render(&self) -> String {
        self.entries
            .iter()
            .map(|e| {
                let mut line = format!("- {}", e.action);
                if !e.required.is_empty() {
                    line.push_str(&format!(" (required: {})", e.required.join(", ")));
                }
                if !e.optional.is_empty() {
                    line.push_str(&format!(" (optional: {})", e.optional.join(", ")));
                }
                if !e.description.is_empty() {
                    line.push_str(&format!(": {}", e.description));
                }
                line
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Clone)]
struct RegistryEntry {
    descriptor: Arc<ModuleDescriptor>,
    executor: Option<Arc<dyn AssessmentModule>>,
}

/// Mutable registry used during startup
#[derive(Default)]
pub struct ModuleRegistryBuilder {
    entries: BTreeMap<String, RegistryEntry>,
}

impl ModuleRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a descriptor bound to its executor
    pub fn register(&mut self, descriptor: ModuleDescriptor, executor: Arc<dyn AssessmentModule>) -> Result<&mut Self> {
        self.insert(descriptor, Some(executor))
    }

    /// Register a descriptor without an executor (planning only)
    pub fn register_descriptor(&mut self, descriptor: ModuleDescriptor) -> Result<&mut Self> {
        self.insert(descriptor, None)
    }

    pub fn register_catalog(&mut self, catalog: CatalogFile) -> Result<&mut Self> {
        for descriptor in catalog.modules {
            self.register_descriptor(descriptor)?;
        }
        Ok(self)
    }

    fn insert(&mut self, descriptor: ModuleDescriptor, executor: Option<Arc<dyn AssessmentModule>>) -> Result<&mut Self> {
        descriptor.validate()?;
        if self.entries.contains_key(&descriptor.action) {
            return Err(OrchestratorError::DuplicateModule(descriptor.action));
        }
        tracing::debug!(action = %descriptor.action, bound = executor.is_some(), "module registered");
        self.entries.insert(
            descriptor.action.clone(),
            RegistryEntry {
                descriptor: Arc::new(descriptor),
                executor,
            },
        );
        Ok(self)
    }

    /// Freeze the registry
    pub fn build(self) -> ModuleRegistry {
        tracing::info!(modules = self.entries.len(), "module registry frozen");
        ModuleRegistry {
            entries: self.entries.into_iter().collect(),
        }
    }
}

/// Immutable action → module mapping
pub struct ModuleRegistry {
    entries: HashMap<String, RegistryEntry>,
}

impl fmt::Debug for ModuleRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleRegistry")
            .field("actions", &self.actions())
            .finish()
    }
}

impl ModuleRegistry {
    pub fn builder() -> ModuleRegistryBuilder {
        ModuleRegistryBuilder::new()
    }

    pub fn lookup(&self, action: &str) -> Result<Arc<ModuleDescriptor>> {
        self.entries
            .get(action)
            .map(|e| e.descriptor.clone())
            .ok_or_else(|| OrchestratorError::ModuleNotFound(action.to_string()))
    }

    /// The executor bound to an action; descriptor-only entries are not runnable
    pub fn executor(&self, action: &str) -> Result<Arc<dyn AssessmentModule>> {
        let entry = self
            .entries
            .get(action)
            .ok_or_else(|| OrchestratorError::ModuleNotFound(action.to_string()))?;
        entry
            .executor
            .clone()
            .ok_or_else(|| OrchestratorError::ModuleNotFound(format!("{} (no executor bound)", action)))
    }

    pub fn contains(&self, action: &str) -> bool {
        self.entries.contains_key(action)
    }

    pub fn list_by_capability(&self, tag: &str) -> Vec<Arc<ModuleDescriptor>> {
        let mut found: Vec<Arc<ModuleDescriptor>> = self
            .entries
            .values()
            .filter(|e| e.descriptor.has_capability(tag))
            .map(|e| e.descriptor.clone())
            .collect();
        found.sort_by(|a, b| a.action.cmp(&b.action));
        found
    }

    /// Action identifiers in sorted order
    pub fn actions(&self) -> Vec<&str> {
        let mut actions: Vec<&str> = self.entries.keys().map(String::as_str).collect();
        actions.sort_unstable();
        actions
    }

    pub fn descriptors(&self) -> Vec<Arc<ModuleDescriptor>> {
        self.actions()
            .into_iter()
            .filter_map(|a| self.entries.get(a).map(|e| e.descriptor.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn catalog(&self) -> ActionCatalog {
        let entries = self
            .descriptors()
            .into_iter()
            .map(|d| {
                let (required, optional): (Vec<_>, Vec<_>) =
                    d.parameters.iter().partition(|(_, spec)| spec.required);
                CatalogEntry {
                    action: d.action.clone(),
                    description: d.description.clone(),
                    required: required.into_iter().map(|(n, _)| n.clone()).collect(),
                    optional: optional.into_iter().map(|(n, _)| n.clone()).collect(),
                    capabilities: d.capabilities.iter().cloned().collect(),
                    target_parameter: d.target_parameter().map(str::to_string),
                }
            })
            .collect();
        ActionCatalog { entries }
    }
}
