//! Which tagboxes want to hear about what.
//!
//! Two lazily built indexes, both owned by a site and built at most once:
//! entity type id -> nosy tagbox ids, and the user-attribute key regexes
//! (one union for the cheap "does anyone care" test, one set per tagbox for
//! routing).

use once_cell::sync::OnceCell;
use regex::{Regex, RegexSet};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use crate::catalog::EntityTypeCatalog;
use crate::error::Result;
use crate::tagbox::TagboxRegistry;

struct KeyInterest {
    /// `None` when no tagbox declares a regex
    union: Option<Regex>,
    per_tagbox: Vec<(i64, RegexSet)>,
}

pub struct InterestIndex {
    registry: Arc<TagboxRegistry>,
    catalog: Arc<dyn EntityTypeCatalog>,
    nosy: OnceCell<HashMap<i64, BTreeSet<i64>>>,
    keys: OnceCell<KeyInterest>,
}

impl InterestIndex {
    pub fn new(registry: Arc<TagboxRegistry>, catalog: Arc<dyn EntityTypeCatalog>) -> Self {
        Self {
            registry,
            catalog,
            nosy: OnceCell::new(),
            keys: OnceCell::new(),
        }
    }

    fn nosy(&self) -> Result<&HashMap<i64, BTreeSet<i64>>> {
        self.nosy.get_or_try_init(|| {
            let specs = self.registry.specs()?;
            let all_types = if specs.iter().any(|s| s.settings.nosy_all_types) {
                self.catalog.list_entity_types()?
            } else {
                BTreeSet::new()
            };

            let mut index: HashMap<i64, BTreeSet<i64>> = HashMap::new();
            for spec in &specs {
                let types = if spec.settings.nosy_all_types {
                    &all_types
                } else {
                    &spec.settings.nosy_entity_types
                };
                for type_id in types {
                    index.entry(*type_id).or_default().insert(spec.id);
                }
            }
            log::debug!("[TAGBOX] Nosy index covers {} entity types", index.len());
            Ok(index)
        })
    }

    fn keys(&self) -> Result<&KeyInterest> {
        self.keys.get_or_try_init(|| {
            let mut patterns = Vec::new();
            let mut per_tagbox = Vec::new();
            for spec in self.registry.specs()? {
                if spec.interest_regexes.is_empty() {
                    continue;
                }
                per_tagbox.push((spec.id, RegexSet::new(&spec.interest_regexes)?));
                patterns.extend(spec.interest_regexes.iter().map(|p| format!("(?:{})", p)));
            }
            let union = if patterns.is_empty() {
                None
            } else {
                Some(Regex::new(&patterns.join("|"))?)
            };
            Ok(KeyInterest { union, per_tagbox })
        })
    }

    /// Tagbox ids nosy about entities of `entity_type_id`.
    pub fn tagboxes_interested_in(&self, entity_type_id: i64) -> Result<BTreeSet<i64>> {
        Ok(self
            .nosy()?
            .get(&entity_type_id)
            .cloned()
            .unwrap_or_default())
    }

    /// The subset of `keys` some tagbox's interest regex matches, in input order.
    pub fn keys_requiring_log(&self, keys: &[String]) -> Result<Vec<String>> {
        let Some(union) = &self.keys()?.union else {
            return Ok(Vec::new());
        };
        Ok(keys.iter().filter(|k| union.is_match(k)).cloned().collect())
    }

    /// Tagbox ids with at least one interest regex matching `key`.
    pub fn tagboxes_interested_in_key(&self, key: &str) -> Result<BTreeSet<i64>> {
        Ok(self
            .keys()?
            .per_tagbox
            .iter()
            .filter(|(_, set)| set.is_match(key))
            .map(|(id, _)| *id)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::models::AffectedType;
    use crate::tagbox::testing::settings;
    use crate::tagbox::TagboxFactory;

    fn index(db: Arc<Database>) -> InterestIndex {
        let registry = Arc::new(TagboxRegistry::new(db.clone(), TagboxFactory::default()));
        InterestIndex::new(registry, db)
    }

    #[test]
    fn test_nosy_index() {
        let db = Arc::new(Database::new(":memory:").unwrap());
        db.upsert_entity_type(1, "user").unwrap();
        db.upsert_entity_type(2, "writeup").unwrap();
        db.upsert_entity_type(3, "document").unwrap();

        let mut writeups = settings(AffectedType::Object, 1.0);
        writeups.nosy_entity_types = [2].into_iter().collect();
        let a = db.upsert_tagbox("writeups", &writeups, &[]).unwrap();

        let mut everything = settings(AffectedType::Object, 1.0);
        everything.nosy_all_types = true;
        let b = db.upsert_tagbox("everything", &everything, &[]).unwrap();

        let index = index(db);
        assert_eq!(index.tagboxes_interested_in(2).unwrap(), [a, b].into_iter().collect());
        assert_eq!(index.tagboxes_interested_in(3).unwrap(), [b].into_iter().collect());
        assert!(index.tagboxes_interested_in(9).unwrap().is_empty());
    }

    #[test]
    fn test_keys_requiring_log() {
        let db = Arc::new(Database::new(":memory:").unwrap());
        let karma = db
            .upsert_tagbox("karma", &settings(AffectedType::User, 1.0), &["^karma$".to_string()])
            .unwrap();
        db.upsert_tagbox("quiet", &settings(AffectedType::User, 1.0), &[])
            .unwrap();

        let index = index(db);
        let keys = vec!["karma".to_string(), "signature".to_string()];
        assert_eq!(index.keys_requiring_log(&keys).unwrap(), vec!["karma".to_string()]);
        assert_eq!(index.tagboxes_interested_in_key("karma").unwrap(), [karma].into_iter().collect());
        assert!(index.tagboxes_interested_in_key("karmas").unwrap().is_empty());
    }

    #[test]
    fn test_union_of_several_tagboxes() {
        let db = Arc::new(Database::new(":memory:").unwrap());
        let a = db
            .upsert_tagbox("a", &settings(AffectedType::User, 1.0), &["^rank_".to_string()])
            .unwrap();
        let b = db
            .upsert_tagbox(
                "b",
                &settings(AffectedType::User, 1.0),
                &["^karma$".to_string(), "^rank_top$".to_string()],
            )
            .unwrap();

        let index = index(db);
        let keys: Vec<String> = ["rank_top", "signature", "karma", "rank_low"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(
            index.keys_requiring_log(&keys).unwrap(),
            vec!["rank_top", "karma", "rank_low"]
        );
        assert_eq!(index.tagboxes_interested_in_key("rank_top").unwrap(), [a, b].into_iter().collect());
    }

    #[test]
    fn test_no_regexes_means_no_keys() {
        let db = Arc::new(Database::new(":memory:").unwrap());
        db.upsert_tagbox("quiet", &settings(AffectedType::User, 1.0), &[])
            .unwrap();
        let index = index(db);
        assert!(index
            .keys_requiring_log(&["karma".to_string()])
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_concurrent_first_use() {
        let db = Arc::new(Database::new(":memory:").unwrap());
        let mut s = settings(AffectedType::Object, 1.0);
        s.nosy_entity_types = [4].into_iter().collect();
        let id = db.upsert_tagbox("writeups", &s, &[]).unwrap();
        let index = index(db);

        std::thread::scope(|scope| {
            let handles: Vec<_> = (0..4)
                .map(|_| scope.spawn(|| index.tagboxes_interested_in(4).unwrap()))
                .collect();
            for handle in handles {
                assert_eq!(handle.join().unwrap(), [id].into_iter().collect());
            }
        });
    }
}
