//! Per-site handle that owns every cache of the core.
//!
//! Nothing in the crate is global: two sites sharing a process get two
//! registries, two interest indexes and two entity-type caches, each built
//! lazily on first use and dropped with the context.

use std::sync::Arc;

use crate::catalog::{CachedEntityTypes, EntityTypeCatalog};
use crate::config::defaults;
use crate::db::Database;
use crate::history::TagHistoryFetcher;
use crate::ingest::Ingestor;
use crate::interest::InterestIndex;
use crate::router::FeedRouter;
use crate::tagbox::{TagboxFactory, TagboxRegistry};

pub struct SiteContext {
    db: Arc<Database>,
    catalog: Arc<dyn EntityTypeCatalog>,
    registry: Arc<TagboxRegistry>,
    interest: InterestIndex,
    history: TagHistoryFetcher,
}

impl SiteContext {
    pub fn new(db: Arc<Database>) -> Self {
        Self::with_factory(db, TagboxFactory::default())
    }

    pub fn with_factory(db: Arc<Database>, factory: TagboxFactory) -> Self {
        let catalog: Arc<dyn EntityTypeCatalog> = Arc::new(CachedEntityTypes::new(
            db.clone(),
            defaults::ENTITY_TYPE_CACHE_CAPACITY,
        ));
        let registry = Arc::new(TagboxRegistry::new(db.clone(), factory));
        let interest = InterestIndex::new(registry.clone(), catalog.clone());
        let history = TagHistoryFetcher::new(db.clone(), catalog.clone(), db.clone());
        Self {
            db,
            catalog,
            registry,
            interest,
            history,
        }
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn catalog(&self) -> &dyn EntityTypeCatalog {
        self.catalog.as_ref()
    }

    pub fn registry(&self) -> &TagboxRegistry {
        &self.registry
    }

    pub fn interest(&self) -> &InterestIndex {
        &self.interest
    }

    pub fn history(&self) -> &TagHistoryFetcher {
        &self.history
    }

    pub fn router(&self) -> FeedRouter<'_> {
        FeedRouter::new(self)
    }

    /// An ingestor reading at most `batch_size` events per kind per pass.
    pub fn ingestor(&self, batch_size: usize) -> Ingestor<'_> {
        Ingestor::new(self, batch_size)
    }
}
