//! Knowledge store: deduplicated entities, action history and the bounded
//! context snapshots the resolvers read from.

pub mod entity;
pub mod query;
pub mod store;
pub mod summary;

pub use entity::{Entity, EntityId, EntityKind, Provenance};
pub use query::{AttributeFilter, AttributePredicate, EntityBinding, EntityQuery};
pub use store::{HistoryRecord, KnowledgeStore};
pub use summary::{ContextSummary, HistoryEntry};
