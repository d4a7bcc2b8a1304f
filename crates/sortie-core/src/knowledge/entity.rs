//! Entities: deduplicated, typed fact records
//!
//! An entity is identified by `(kind, identity key)`. The [`EntityId`] is a
//! BLAKE3 digest of that pair, so rediscovering the same host from a
//! different action lands on the same record.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use crate::error::{OrchestratorError, Result};
use crate::types::{now, value_to_text, RequestId, Timestamp};

/// Entity type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Host,
    Service,
    Credential,
    Vulnerability,
    Finding,
}

impl EntityKind {
    pub const ALL: [EntityKind; 5] = [
        EntityKind::Host,
        EntityKind::Service,
        EntityKind::Credential,
        EntityKind::Vulnerability,
        EntityKind::Finding,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EntityKind::Host => "host",
            EntityKind::Service => "service",
            EntityKind::Credential => "credential",
            EntityKind::Vulnerability => "vulnerability",
            EntityKind::Finding => "finding",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self> {
        EntityKind::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| OrchestratorError::Validation(format!("unknown entity kind '{}'", s)))
    }
}

/// Stable entity identifier (hex BLAKE3 of kind + identity key)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    pub fn derive(kind: EntityKind, identity_key: &str) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(kind.as_str().as_bytes());
        hasher.update(&[0u8]);
        hasher.update(identity_key.as_bytes());
        Self(hex::encode(&hasher.finalize().as_bytes()[..16]))
    }

    /// Wrap an already-computed identifier
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Which action contributed to an entity, and when
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    pub action: String,
    pub request_id: Option<RequestId>,
    pub recorded_at: Timestamp,
}

impl Provenance {
    pub fn new(action: impl Into<String>, request_id: Option<RequestId>) -> Self {
        Self {
            action: action.into(),
            request_id,
            recorded_at: now(),
        }
    }

    /// Provenance for entities entered directly (scope seeding, operator input)
    pub fn manual() -> Self {
        Self::new("manual", None)
    }
}

/// A typed fact record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: EntityId,
    pub kind: EntityKind,
    pub identity_key: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub provenance: Vec<Provenance>,

    /// Store revision of the last merge (0 until stored)
    #[serde(default)]
    pub revision: u64,

    pub first_seen: Timestamp,
    pub last_updated: Timestamp,
}

impl Entity {
    pub fn new(kind: EntityKind, identity_key: impl Into<String>) -> Self {
        let identity_key = identity_key.into().trim().to_string();
        let timestamp = now();
        Self {
            id: EntityId::derive(kind, &identity_key),
            kind,
            identity_key,
            attributes: BTreeMap::new(),
            tags: BTreeSet::new(),
            provenance: Vec::new(),
            revision: 0,
            first_seen: timestamp,
            last_updated: timestamp,
        }
    }

    /// A host keyed by its address; the address is also exposed as an attribute
    pub fn host(address: impl Into<String>) -> Self {
        let address = address.into();
        Self::new(EntityKind::Host, address.clone()).with_attribute("address", address)
    }

    /// A service keyed by `host:port/protocol`
    pub fn service(host: &str, port: u16, protocol: &str) -> Self {
        Self::new(EntityKind::Service, format!("{}:{}/{}", host, port, protocol))
            .with_attribute("host", host)
            .with_attribute("port", port)
            .with_attribute("protocol", protocol)
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn produced_by(mut self, action: impl Into<String>, request_id: Option<RequestId>) -> Self {
        self.provenance.push(Provenance::new(action, request_id));
        self
    }

    pub fn attribute(&self, name: &str) -> Option<&serde_json::Value> {
        self.attributes.get(name)
    }

    /// Attribute rendered as text; the pseudo-attribute `identity_key` is always present
    pub fn attribute_text(&self, name: &str) -> Option<String> {
        if name == "identity_key" {
            return Some(self.identity_key.clone());
        }
        self.attributes.get(name).map(value_to_text)
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t.eq_ignore_ascii_case(tag))
    }

    /// Reject records that cannot be deduplicated
    pub fn validate(&self) -> Result<()> {
        if self.identity_key.trim().is_empty() {
            return Err(OrchestratorError::Validation(format!(
                "{} entity has an empty identity key",
                self.kind
            )));
        }
        if self.id != EntityId::derive(self.kind, &self.identity_key) {
            return Err(OrchestratorError::Validation(format!(
                "entity id {} does not match its kind and identity key",
                self.id
            )));
        }
        Ok(())
    }

    /// Merge a newer contribution into this record.
    ///
    /// Attributes are last-writer-wins per name, tags are unioned and every
    /// provenance entry is kept.
    pub(crate) fn merge(&mut self, incoming: Entity, revision: u64) {
        debug_assert_eq!(self.id, incoming.id);
        self.attributes.extend(incoming.attributes);
        self.tags.extend(incoming.tags);
        self.provenance.extend(incoming.provenance);
        self.revision = self.revision.max(revision);
        self.last_updated = now();
    }

    pub(crate) fn stamped(mut self, revision: u64) -> Self {
        self.revision = revision;
        self.last_updated = now();
        self
    }

    /// One-line rendering used in context summaries
    pub fn summary_line(&self) -> String {
        let mut line = format!("{} {}", self.kind, self.identity_key);
        if !self.tags.is_empty() {
            let tags: Vec<&str> = self.tags.iter().map(String::as_str).collect();
            line.push_str(&format!(" [{}]", tags.join(",")));
        }
        let attrs: Vec<String> = self
            .attributes
            .iter()
            .filter(|(name, _)| name.as_str() != "address")
            .take(4)
            .map(|(name, value)| format!("{}={}", name, value_to_text(value)))
            .collect();
        if !attrs.is_empty() {
            line.push_str(&format!(" {}", attrs.join(" ")));
        }
        line
    }
}
