//! The knowledge store: the only shared mutable resource of a session
//!
//! Entities live in a `DashMap` keyed by [`EntityId`]; a merge holds the
//! entry exclusively for the duration of the merge, and readers clone whole
//! records, so a half-merged entity is never observable. History is
//! append-only and deduplicated by request id.

use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use parking_lot::RwLock;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use super::entity::{Entity, EntityId, EntityKind, Provenance};
use super::query::{AttributeFilter, EntityQuery};
use super::summary::{ContextSummary, HistoryEntry};
use crate::action::{ActionRequest, ActionResult};
use crate::error::{OrchestratorError, Result};
use crate::types::{now, RequestId, SessionId, Timestamp};

/// Utterances kept regardless of snapshot size
const MAX_UTTERANCES: usize = 256;

/// One request/result pair, appended once per request
#[derive(Debug, Clone)]
pub struct HistoryRecord {
    pub request: Arc<ActionRequest>,
    pub result: Arc<ActionResult>,
    pub recorded_at: Timestamp,
}

impl HistoryRecord {
    fn entry(&self) -> HistoryEntry {
        HistoryEntry {
            request_id: self.request.id,
            action: self.request.action.clone(),
            parameters: self.request.parameters.clone(),
            status: self.result.status,
            error: self.result.error.clone(),
            entities_produced: self.result.entities.len(),
            finished_at: self.result.finished_at,
        }
    }
}

/// Assessment context of one session
#[derive(Debug)]
pub struct KnowledgeStore {
    session_id: SessionId,
    entities: DashMap<EntityId, Entity>,
    history: RwLock<Vec<HistoryRecord>>,
    recorded: DashSet<RequestId>,
    utterances: RwLock<VecDeque<String>>,
    revision: AtomicU64,
    sealed: AtomicBool,
}

impl KnowledgeStore {
    pub fn new(session_id: SessionId) -> Self {
        Self {
            session_id,
            entities: DashMap::new(),
            history: RwLock::new(Vec::new()),
            recorded: DashSet::new(),
            utterances: RwLock::new(VecDeque::new()),
            revision: AtomicU64::new(0),
            sealed: AtomicBool::new(false),
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Current store revision (incremented once per upsert batch)
    pub fn revision(&self) -> u64 {
        self.revision.load(Ordering::SeqCst)
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    /// Insert or merge one entity.
    ///
    /// Fails only on malformed input (`Validation`) or after the owning
    /// session closed (`SessionClosed`).
    pub fn upsert_entity(&self, entity: Entity) -> Result<EntityId> {
        let mut ids = self.upsert_batch(vec![entity])?;
        Ok(ids.remove(0))
    }

    /// Insert or merge several entities under a single revision.
    ///
    /// The whole batch is validated before anything is written.
    pub fn upsert_batch(&self, entities: Vec<Entity>) -> Result<Vec<EntityId>> {
        self.ensure_writable()?;
        for entity in &entities {
            entity.validate()?;
        }
        if entities.is_empty() {
            return Ok(Vec::new());
        }

        let revision = self.revision.fetch_add(1, Ordering::SeqCst) + 1;
        let ids = entities
            .into_iter()
            .map(|entity| self.merge_one(entity, revision))
            .collect();
        Ok(ids)
    }

    fn merge_one(&self, mut entity: Entity, revision: u64) -> EntityId {
        if entity.provenance.is_empty() {
            entity.provenance.push(Provenance::manual());
        }
        let id = entity.id.clone();
        match self.entities.entry(id.clone()) {
            Entry::Occupied(mut existing) => {
                existing.get_mut().merge(entity, revision);
                tracing::debug!(entity = %id, revision, "merged entity");
            }
            Entry::Vacant(slot) => {
                tracing::debug!(entity = %id, kind = %entity.kind, key = %entity.identity_key, revision, "new entity");
                slot.insert(entity.stamped(revision));
            }
        }
        id
    }

    pub fn get(&self, id: &EntityId) -> Option<Entity> {
        self.entities.get(id).map(|e| e.value().clone())
    }

    /// Entities matching the type and attribute filters, most recent first
    pub fn query(&self, kind: Option<EntityKind>, filter: &AttributeFilter) -> Vec<Entity> {
        let mut matches: Vec<Entity> = self
            .entities
            .iter()
            .filter(|e| kind.map_or(true, |k| e.kind == k) && filter.matches(e.value()))
            .map(|e| e.value().clone())
            .collect();
        sort_recent_first(&mut matches);
        matches
    }

    pub fn find(&self, query: &EntityQuery) -> Vec<Entity> {
        self.query(query.kind, &query.filter)
    }

    /// Append a request/result pair.
    ///
    /// Returns `false` when a record for the request already exists.
    pub fn append_history(&self, request: Arc<ActionRequest>, result: Arc<ActionResult>) -> Result<bool> {
        self.ensure_writable()?;
        if !self.recorded.insert(request.id) {
            tracing::warn!(request_id = %request.id, "history already holds this request, ignoring");
            return Ok(false);
        }
        self.history.write().push(HistoryRecord {
            request,
            result,
            recorded_at: now(),
        });
        Ok(true)
    }

    /// Merge a terminal result into the store and append it to history.
    ///
    /// Produced entities are merged under one revision and only for
    /// successful results. Each request is committed at most once; later
    /// commits return `false` and change nothing.
    pub fn commit_result(&self, request: Arc<ActionRequest>, result: Arc<ActionResult>) -> Result<bool> {
        self.ensure_writable()?;
        if self.recorded.contains(&request.id) {
            tracing::warn!(request_id = %request.id, "result already committed, dropping");
            return Ok(false);
        }

        if result.is_success() && !result.entities.is_empty() {
            let entities: Vec<Entity> = result
                .entities
                .iter()
                .filter(|entity| match entity.validate() {
                    Ok(()) => true,
                    Err(err) => {
                        tracing::warn!(request_id = %request.id, action = %request.action, error = %err, "dropping invalid entity");
                        false
                    }
                })
                .cloned()
                .map(|mut entity| {
                    let attributed = entity
                        .provenance
                        .iter()
                        .any(|p| p.request_id == Some(request.id));
                    if !attributed {
                        entity
                            .provenance
                            .push(Provenance::new(request.action.clone(), Some(request.id)));
                    }
                    entity
                })
                .collect();
            if !entities.is_empty() {
                self.upsert_batch(entities)?;
            }
        }

        self.append_history(request, result)
    }

    /// Full history, oldest first
    pub fn history(&self) -> Vec<HistoryRecord> {
        self.history.read().clone()
    }

    pub fn history_for(&self, request_id: RequestId) -> Option<HistoryRecord> {
        self.history
            .read()
            .iter()
            .find(|r| r.request.id == request_id)
            .cloned()
    }

    pub fn history_len(&self) -> usize {
        self.history.read().len()
    }

    /// Record one user command in the conversation history
    pub fn record_utterance(&self, text: impl Into<String>) -> Result<()> {
        self.ensure_writable()?;
        let mut utterances = self.utterances.write();
        utterances.push_back(text.into());
        while utterances.len() > MAX_UTTERANCES {
            utterances.pop_front();
        }
        Ok(())
    }

    /// Bounded snapshot: the `max_items` most recent entities, history
    /// entries and utterances.
    pub fn snapshot_context(&self, max_items: usize) -> ContextSummary {
        let mut entities: Vec<Entity> = self.entities.iter().map(|e| e.value().clone()).collect();
        sort_recent_first(&mut entities);
        entities.truncate(max_items);

        let history: Vec<HistoryEntry> = {
            let records = self.history.read();
            let skip = records.len().saturating_sub(max_items);
            records.iter().skip(skip).map(HistoryRecord::entry).collect()
        };

        let utterances: Vec<String> = {
            let all = self.utterances.read();
            let skip = all.len().saturating_sub(max_items);
            all.iter().skip(skip).cloned().collect()
        };

        ContextSummary {
            session_id: self.session_id,
            revision: self.revision(),
            entities,
            history,
            utterances,
            captured_at: now(),
        }
    }

    /// Refuse all further writes. Used when the owning session closes.
    pub fn seal(&self) {
        self.sealed.store(true, Ordering::SeqCst);
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::SeqCst)
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.is_sealed() {
            return Err(OrchestratorError::SessionClosed(self.session_id));
        }
        Ok(())
    }
}

fn sort_recent_first(entities: &mut [Entity]) {
    entities.sort_by(|a, b| b.revision.cmp(&a.revision).then_with(|| a.id.cmp(&b.id)));
}
