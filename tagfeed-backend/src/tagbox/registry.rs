//! Tagbox registry: constructs every registered tagbox once per site and
//! serves projected, defensively copied records.
//!
//! Settings and instances are cached for the life of the registry. Watermarks
//! are never cached: they are read from the store on every request that asks
//! for them and omitted otherwise.

use once_cell::sync::OnceCell;
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use crate::db::Database;
use crate::error::{FeedError, Result};
use crate::models::{TagboxField, TagboxRecord, TagboxRef, TagboxSpec, Watermarks};

use super::{validate_spec, DefaultTagbox, TagCountTagbox, Tagbox};

/// Builds a tagbox implementation from its spec.
pub type TagboxConstructor = fn(TagboxSpec) -> Result<Arc<dyn Tagbox>>;

/// Maps a tagbox `kind` to its constructor.
#[derive(Clone)]
pub struct TagboxFactory {
    constructors: HashMap<String, TagboxConstructor>,
}

impl TagboxFactory {
    /// A factory that knows no kinds.
    pub fn new() -> Self {
        Self {
            constructors: HashMap::new(),
        }
    }

    /// A factory with the built-in kinds `default` and `tag_count`.
    pub fn with_builtins() -> Self {
        let mut factory = Self::new();
        factory.register("default", DefaultTagbox::construct);
        factory.register("tag_count", TagCountTagbox::construct);
        factory
    }

    /// Add or replace the constructor for `kind`.
    pub fn register(&mut self, kind: impl Into<String>, constructor: TagboxConstructor) {
        self.constructors.insert(kind.into(), constructor);
    }

    pub fn knows(&self, kind: &str) -> bool {
        self.constructors.contains_key(kind)
    }

    /// Validate `spec` and construct it. Unknown kinds are configuration errors.
    pub fn construct(&self, spec: TagboxSpec) -> Result<Arc<dyn Tagbox>> {
        validate_spec(&spec)?;
        let constructor = self.constructors.get(&spec.settings.kind).ok_or_else(|| {
            FeedError::config(&spec.name, format!("unknown kind '{}'", spec.settings.kind))
        })?;
        constructor(spec)
    }
}

impl Default for TagboxFactory {
    fn default() -> Self {
        Self::with_builtins()
    }
}

/// Everything built on first load.
struct LoadedTagboxes {
    specs: BTreeMap<i64, TagboxSpec>,
    instances: BTreeMap<i64, Arc<dyn Tagbox>>,
    by_name: HashMap<String, i64>,
    /// Registered rows that failed to decode or construct
    excluded: BTreeSet<i64>,
}

pub struct TagboxRegistry {
    db: Arc<Database>,
    factory: TagboxFactory,
    loaded: OnceCell<LoadedTagboxes>,
    disabled: RwLock<HashSet<i64>>,
}

impl TagboxRegistry {
    pub fn new(db: Arc<Database>, factory: TagboxFactory) -> Self {
        Self {
            db,
            factory,
            loaded: OnceCell::new(),
            disabled: RwLock::new(HashSet::new()),
        }
    }

    fn loaded(&self) -> Result<&LoadedTagboxes> {
        self.loaded.get_or_try_init(|| self.construct_all())
    }

    fn construct_all(&self) -> Result<LoadedTagboxes> {
        let mut loaded = LoadedTagboxes {
            specs: BTreeMap::new(),
            instances: BTreeMap::new(),
            by_name: HashMap::new(),
            excluded: BTreeSet::new(),
        };

        for row in self.db.list_tagbox_rows()? {
            let (id, name) = (row.id, row.name.clone());
            let built = row
                .into_spec()
                .and_then(|spec| Ok((spec.clone(), self.factory.construct(spec)?)));
            match built {
                Ok((spec, instance)) => {
                    loaded.by_name.insert(name, id);
                    loaded.specs.insert(id, spec);
                    loaded.instances.insert(id, instance);
                }
                Err(e) => {
                    log::error!("[TAGBOX] Excluding '{}' (id={}): {}", name, id, e);
                    loaded.excluded.insert(id);
                }
            }
        }

        log::info!(
            "[TAGBOX] Loaded {} tagboxes ({} excluded)",
            loaded.instances.len(),
            loaded.excluded.len()
        );
        Ok(loaded)
    }

    /// Every constructed tagbox, projected to `fields` (all fields when `None`).
    pub fn load(&self, fields: Option<&[TagboxField]>) -> Result<Vec<TagboxRecord>> {
        let loaded = self.loaded()?;
        let mut marks = if wants(fields, TagboxField::Watermarks) {
            Some(self.db.list_tagbox_watermarks()?)
        } else {
            None
        };

        Ok(loaded
            .specs
            .values()
            .map(|spec| {
                let watermarks = marks.as_mut().and_then(|m| m.remove(&spec.id));
                project(spec, fields, watermarks)
            })
            .collect())
    }

    /// One tagbox by id or name, or `None` if it is unknown or excluded.
    pub fn load_one(
        &self,
        which: &TagboxRef,
        fields: Option<&[TagboxField]>,
    ) -> Result<Option<TagboxRecord>> {
        let loaded = self.loaded()?;
        let id = match which {
            TagboxRef::Id(id) => *id,
            TagboxRef::Name(name) => match loaded.by_name.get(name) {
                Some(id) => *id,
                None => return Ok(None),
            },
        };
        let Some(spec) = loaded.specs.get(&id) else {
            return Ok(None);
        };
        let watermarks = if wants(fields, TagboxField::Watermarks) {
            self.db.get_tagbox_watermarks(id)?
        } else {
            None
        };
        Ok(Some(project(spec, fields, watermarks)))
    }

    /// The constructed instance for `id`, disabled or not.
    pub fn get(&self, id: i64) -> Result<Option<Arc<dyn Tagbox>>> {
        Ok(self.loaded()?.instances.get(&id).cloned())
    }

    /// Instances eligible for dispatch, ordered by id.
    pub fn active(&self) -> Result<Vec<Arc<dyn Tagbox>>> {
        let loaded = self.loaded()?;
        let disabled = self.disabled.read();
        Ok(loaded
            .instances
            .iter()
            .filter(|(id, _)| !disabled.contains(*id))
            .map(|(_, t)| t.clone())
            .collect())
    }

    /// Specs of every constructed tagbox.
    pub fn specs(&self) -> Result<Vec<TagboxSpec>> {
        Ok(self.loaded()?.specs.values().cloned().collect())
    }

    /// Stop dispatching to `id` for the life of this registry.
    pub fn disable(&self, id: i64, reason: &FeedError) {
        if self.disabled.write().insert(id) {
            log::error!("[TAGBOX] Disabling tagbox {}: {}", id, reason);
        }
    }

    pub fn is_disabled(&self, id: i64) -> bool {
        self.disabled.read().contains(&id)
    }

    /// Ids that must not be dispatched or run: excluded at load or disabled since.
    pub fn unavailable_ids(&self) -> Result<BTreeSet<i64>> {
        let mut ids = self.loaded()?.excluded.clone();
        ids.extend(self.disabled.read().iter().copied());
        Ok(ids)
    }
}

fn wants(fields: Option<&[TagboxField]>, field: TagboxField) -> bool {
    fields.is_none_or(|f| f.contains(&field))
}

fn project(
    spec: &TagboxSpec,
    fields: Option<&[TagboxField]>,
    watermarks: Option<Watermarks>,
) -> TagboxRecord {
    TagboxRecord {
        id: spec.id,
        name: spec.name.clone(),
        settings: wants(fields, TagboxField::Settings).then(|| spec.settings.clone()),
        interest_regexes: wants(fields, TagboxField::InterestRegexes)
            .then(|| spec.interest_regexes.clone()),
        watermarks,
    }
}
