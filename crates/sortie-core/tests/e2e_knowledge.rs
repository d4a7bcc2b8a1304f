//! Merge properties of the knowledge store

use proptest::prelude::*;
use sortie_core::{Entity, EntityKind, EntityQuery, KnowledgeStore, SessionId};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone)]
struct Observation {
    attributes: BTreeMap<String, i64>,
    tags: BTreeSet<String>,
}

fn observation() -> impl Strategy<Value = Observation> {
    (
        prop::collection::btree_map(prop::sample::select(vec!["os", "ttl", "banner", "uptime"]), -5i64..5, 0..4),
        prop::collection::btree_set(prop::sample::select(vec!["ssh", "http", "smb"]), 0..3),
    )
        .prop_map(|(attributes, tags)| Observation {
            attributes: attributes.into_iter().map(|(k, v)| (k.to_string(), v)).collect(),
            tags: tags.into_iter().map(str::to_string).collect(),
        })
}

proptest! {
    #[test]
    fn repeated_discoveries_fold_into_one_entity(observations in prop::collection::vec(observation(), 1..12)) {
        let store = KnowledgeStore::new(SessionId::new());

        let mut expected_attributes = BTreeMap::new();
        let mut expected_tags = BTreeSet::new();
        let mut last_revision = 0;
        for (i, obs) in observations.iter().enumerate() {
            let mut entity = Entity::host("10.0.0.5").produced_by(format!("sensor-{}", i), None);
            for (name, value) in &obs.attributes {
                entity = entity.with_attribute(name.clone(), *value);
                expected_attributes.insert(name.clone(), serde_json::json!(value));
            }
            for tag in &obs.tags {
                entity = entity.with_tag(tag.clone());
                expected_tags.insert(tag.clone());
            }
            let id = store.upsert_entity(entity).unwrap();

            let stored = store.get(&id).unwrap();
            prop_assert!(stored.revision > last_revision);
            last_revision = stored.revision;
        }

        let hosts = store.find(&EntityQuery::of(EntityKind::Host));
        prop_assert_eq!(hosts.len(), 1);
        let host = &hosts[0];

        for (name, value) in &expected_attributes {
            prop_assert_eq!(host.attribute(name), Some(value));
        }
        let address = host.attribute_text("address");
        prop_assert_eq!(address.as_deref(), Some("10.0.0.5"));
        for tag in &expected_tags {
            prop_assert!(host.has_tag(tag));
        }

        let sources: Vec<String> = host.provenance.iter().map(|p| p.action.clone()).collect();
        let expected_sources: Vec<String> = (0..observations.len()).map(|i| format!("sensor-{}", i)).collect();
        prop_assert_eq!(sources, expected_sources);
        prop_assert_eq!(store.revision(), observations.len() as u64);
    }

    #[test]
    fn snapshot_never_exceeds_its_bound(hosts in 0usize..60, bound in 1usize..25) {
        let store = KnowledgeStore::new(SessionId::new());
        for i in 0..hosts {
            store.upsert_entity(Entity::host(format!("10.0.1.{}", i))).unwrap();
        }

        let summary = store.snapshot_context(bound);
        prop_assert!(summary.entities.len() <= bound);
        prop_assert_eq!(summary.entities.len(), hosts.min(bound));
    }
}

#[test]
fn distinct_hosts_stay_distinct() {
    let store = KnowledgeStore::new(SessionId::new());
    store.upsert_entity(Entity::host("10.0.0.5")).unwrap();
    store.upsert_entity(Entity::host("10.0.0.6")).unwrap();
    store.upsert_entity(Entity::host("10.0.0.5").with_tag("http")).unwrap();

    assert_eq!(store.entity_count(), 2);
    assert_eq!(store.find(&EntityQuery::of(EntityKind::Host).with_tag("http")).len(), 1);
}
