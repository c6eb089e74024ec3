//! Entity-type catalog and metadata enricher.
//!
//! The filter stage and the interest index only need to know which type an
//! entity has; the history fetcher additionally attaches display metadata.
//! Both are traits so a site can back them with something other than the
//! local tables.

use moka::sync::Cache;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use crate::db::Database;
use crate::error::Result;
use crate::models::TagEvent;

pub trait EntityTypeCatalog: Send + Sync {
    /// Every entity type id known to the site.
    fn list_entity_types(&self) -> Result<BTreeSet<i64>>;

    /// Batched type lookup. Unknown entities are absent from the result.
    fn entity_types_of(&self, entity_ids: &[i64]) -> Result<HashMap<i64, i64>>;
}

pub trait MetadataEnricher: Send + Sync {
    /// Fill `TagEvent::entity` for every event whose entity is known.
    fn attach_metadata(&self, events: &mut [TagEvent]) -> Result<()>;
}

impl EntityTypeCatalog for Database {
    fn list_entity_types(&self) -> Result<BTreeSet<i64>> {
        self.list_entity_type_ids()
    }

    fn entity_types_of(&self, entity_ids: &[i64]) -> Result<HashMap<i64, i64>> {
        Ok(self
            .entity_meta_of(entity_ids)?
            .into_iter()
            .map(|(id, meta)| (id, meta.entity_type_id))
            .collect())
    }
}

impl MetadataEnricher for Database {
    fn attach_metadata(&self, events: &mut [TagEvent]) -> Result<()> {
        let mut ids: Vec<i64> = events.iter().filter_map(|e| e.entity_id).collect();
        ids.sort_unstable();
        ids.dedup();
        let meta = self.entity_meta_of(&ids)?;
        for event in events.iter_mut() {
            event.entity = event.entity_id.and_then(|id| meta.get(&id).cloned());
        }
        Ok(())
    }
}

/// Memoises entity type lookups in front of another catalog. Entity types are
/// stable once assigned, so only misses reach the inner catalog.
pub struct CachedEntityTypes {
    inner: Arc<dyn EntityTypeCatalog>,
    types: Cache<i64, i64>,
}

impl CachedEntityTypes {
    pub fn new(inner: Arc<dyn EntityTypeCatalog>, capacity: u64) -> Self {
        Self {
            inner,
            types: Cache::builder()
                .max_capacity(capacity)
                .time_to_idle(Duration::from_secs(3600))
                .build(),
        }
    }
}

impl EntityTypeCatalog for CachedEntityTypes {
    fn list_entity_types(&self) -> Result<BTreeSet<i64>> {
        self.inner.list_entity_types()
    }

    fn entity_types_of(&self, entity_ids: &[i64]) -> Result<HashMap<i64, i64>> {
        let mut found = HashMap::with_capacity(entity_ids.len());
        let mut misses = Vec::new();
        for id in entity_ids {
            match self.types.get(id) {
                Some(type_id) => {
                    found.insert(*id, type_id);
                }
                None => misses.push(*id),
            }
        }
        if !misses.is_empty() {
            misses.sort_unstable();
            misses.dedup();
            for (id, type_id) in self.inner.entity_types_of(&misses)? {
                self.types.insert(id, type_id);
                found.insert(id, type_id);
            }
        }
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingCatalog {
        calls: AtomicUsize,
    }

    impl EntityTypeCatalog for CountingCatalog {
        fn list_entity_types(&self) -> Result<BTreeSet<i64>> {
            Ok([1, 2].into_iter().collect())
        }

        fn entity_types_of(&self, entity_ids: &[i64]) -> Result<HashMap<i64, i64>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(entity_ids
                .iter()
                .filter(|id| **id < 100)
                .map(|id| (*id, id % 2 + 1))
                .collect())
        }
    }

    #[test]
    fn test_cached_lookup_only_queries_misses() {
        let inner = Arc::new(CountingCatalog {
            calls: AtomicUsize::new(0),
        });
        let cached = CachedEntityTypes::new(inner.clone(), 100);

        let first = cached.entity_types_of(&[10, 11, 500]).unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(first[&10], 1);
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);

        let second = cached.entity_types_of(&[10, 11]).unwrap();
        assert_eq!(second, first);
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_database_enricher() {
        let db = Database::new(":memory:").unwrap();
        db.upsert_entity(10, 3, Some("Ten")).unwrap();
        let mut events = vec![TagEvent {
            tag_id: Some(1),
            entity_id: Some(10),
            user_id: Some(100),
            tag_name_id: Some(1),
            deactivated: false,
            created_at: Utc::now(),
            deactivation_id: None,
            user_change_id: None,
            attr_key: None,
            entity: None,
        }];
        events.push(TagEvent {
            entity_id: Some(11),
            ..events[0].clone()
        });

        db.attach_metadata(&mut events).unwrap();
        assert_eq!(events[0].entity.as_ref().map(|m| m.entity_type_id), Some(3));
        assert!(events[1].entity.is_none());
        assert_eq!(db.entity_types_of(&[10, 11]).unwrap().len(), 1);
    }
}
