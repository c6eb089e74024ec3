//! Routes event batches to the tagboxes that care and persists what they return.
//!
//! Tag creations and deactivations go to tagboxes nosy about the tagged
//! entity's type. User changes are first narrowed to keys any tagbox wants,
//! then sent to the tagboxes whose own regexes match the key. Failures are
//! isolated per tagbox: one broken tagbox never starves the others.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::context::SiteContext;
use crate::error::{FeedError, Result};
use crate::models::{Contribution, EventKind, TagEvent, WatermarkKind};
use crate::tagbox::Tagbox;

/// What happened to one routed batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RouteReport {
    /// Contributions persisted, per tagbox
    pub delivered: BTreeMap<i64, usize>,
    pub failed: BTreeSet<i64>,
}

pub struct FeedRouter<'a> {
    ctx: &'a SiteContext,
}

impl<'a> FeedRouter<'a> {
    pub fn new(ctx: &'a SiteContext) -> Self {
        Self { ctx }
    }

    /// Split `events` by interested, dispatchable tagbox. Events nobody
    /// cares about are dropped.
    pub fn plan(&self, kind: EventKind, events: &[TagEvent]) -> Result<BTreeMap<i64, Vec<TagEvent>>> {
        let dispatchable: BTreeSet<i64> = self
            .ctx
            .registry()
            .active()?
            .iter()
            .map(|t| t.id())
            .collect();
        let mut plan: BTreeMap<i64, Vec<TagEvent>> = BTreeMap::new();

        match kind {
            EventKind::Creation | EventKind::Deactivation => {
                let mut ids: Vec<i64> = events.iter().filter_map(|e| e.entity_id).collect();
                ids.sort_unstable();
                ids.dedup();
                let types = self.ctx.catalog().entity_types_of(&ids)?;

                let mut interested: HashMap<i64, BTreeSet<i64>> = HashMap::new();
                for event in events {
                    let Some(type_id) = event.entity_id.and_then(|id| types.get(&id)) else {
                        continue;
                    };
                    if !interested.contains_key(type_id) {
                        let ids = self.ctx.interest().tagboxes_interested_in(*type_id)?;
                        interested.insert(*type_id, ids);
                    }
                    for tagbox_id in &interested[type_id] {
                        if dispatchable.contains(tagbox_id) {
                            plan.entry(*tagbox_id).or_default().push(event.clone());
                        }
                    }
                }
            }
            EventKind::UserChange => {
                let mut keys: Vec<String> = events.iter().filter_map(|e| e.attr_key.clone()).collect();
                keys.sort();
                keys.dedup();
                let wanted: BTreeSet<String> =
                    self.ctx.interest().keys_requiring_log(&keys)?.into_iter().collect();

                let mut interested: HashMap<&str, BTreeSet<i64>> = HashMap::new();
                for event in events {
                    let Some(key) = event.attr_key.as_deref().filter(|k| wanted.contains(*k)) else {
                        continue;
                    };
                    if !interested.contains_key(key) {
                        interested.insert(key, self.ctx.interest().tagboxes_interested_in_key(key)?);
                    }
                    for tagbox_id in &interested[key] {
                        if dispatchable.contains(tagbox_id) {
                            plan.entry(*tagbox_id).or_default().push(event.clone());
                        }
                    }
                }
            }
        }
        Ok(plan)
    }

    /// Run the feed entry point matching `kind`. Nothing is persisted.
    pub fn feed(&self, tagbox: &dyn Tagbox, kind: EventKind, events: Vec<TagEvent>) -> Result<Vec<Contribution>> {
        let catalog = self.ctx.catalog();
        match kind {
            EventKind::Creation => tagbox.feed_new_tags(catalog, events),
            EventKind::Deactivation => tagbox.feed_deactivated_tags(catalog, events),
            EventKind::UserChange => tagbox.feed_user_changes(catalog, events),
        }
    }

    /// Feed one tagbox and persist its contributions, advancing `watermark`
    /// in the same transaction. Returns the number of entries appended.
    pub fn deliver(
        &self,
        tagbox_id: i64,
        kind: EventKind,
        events: Vec<TagEvent>,
        watermark: Option<(WatermarkKind, i64)>,
    ) -> Result<usize> {
        let contributions = if events.is_empty() {
            Vec::new()
        } else {
            match self.ctx.registry().get(tagbox_id)? {
                Some(tagbox) => self.feed(tagbox.as_ref(), kind, events)?,
                None => Vec::new(),
            }
        };
        self.ctx
            .db()
            .append_feeder_entries(tagbox_id, &contributions, watermark)
    }

    /// Plan, feed and persist one batch without touching watermarks.
    pub fn route(&self, kind: EventKind, events: &[TagEvent]) -> Result<RouteReport> {
        let mut report = RouteReport::default();
        for (tagbox_id, batch) in self.plan(kind, events)? {
            match self.deliver(tagbox_id, kind, batch, None) {
                Ok(appended) => {
                    report.delivered.insert(tagbox_id, appended);
                }
                Err(e) => {
                    self.isolate(tagbox_id, &e);
                    report.failed.insert(tagbox_id);
                }
            }
        }
        if !report.delivered.is_empty() || !report.failed.is_empty() {
            log::info!(
                "[FEEDER] Routed {} {:?} events: {} tagboxes fed, {} failed",
                events.len(),
                kind,
                report.delivered.len(),
                report.failed.len()
            );
        }
        Ok(report)
    }

    /// Log a per-tagbox failure; configuration errors also disable the tagbox.
    pub(crate) fn isolate(&self, tagbox_id: i64, error: &FeedError) {
        if error.is_config() {
            self.ctx.registry().disable(tagbox_id, error);
        } else {
            log::error!("[FEEDER] Tagbox {} failed to ingest: {}", tagbox_id, error);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::EntityTypeCatalog;
    use crate::db::query::AggregateQuery;
    use crate::db::Database;
    use crate::models::{AffectedType, TagboxSpec};
    use crate::tagbox::testing::{settings, tag};
    use crate::tagbox::TagboxFactory;
    use std::sync::Arc;

    /// Rejects every batch.
    struct Broken {
        spec: TagboxSpec,
    }

    impl Tagbox for Broken {
        fn spec(&self) -> &TagboxSpec {
            &self.spec
        }

        fn feed_new_tags(
            &self,
            _catalog: &dyn EntityTypeCatalog,
            _events: Vec<TagEvent>,
        ) -> Result<Vec<Contribution>> {
            Err(FeedError::config(self.name(), "cannot ingest"))
        }
    }

    fn build_broken(spec: TagboxSpec) -> Result<Arc<dyn Tagbox>> {
        Ok(Arc::new(Broken { spec }))
    }

    fn site() -> (SiteContext, i64, i64, i64) {
        let db = Arc::new(Database::new(":memory:").unwrap());
        db.upsert_entity(10, 2, None).unwrap();
        db.upsert_entity(11, 3, None).unwrap();

        let mut writeups = settings(AffectedType::Object, 2.0);
        writeups.nosy_entity_types = [2].into_iter().collect();
        let w = db.upsert_tagbox("writeups", &writeups, &[]).unwrap();

        let mut broken = settings(AffectedType::Object, 1.0);
        broken.kind = "broken".to_string();
        broken.nosy_entity_types = [2, 3].into_iter().collect();
        let b = db.upsert_tagbox("broken", &broken, &[]).unwrap();

        let mut karma = settings(AffectedType::User, 1.0);
        karma.kind = "karma".to_string();
        let k = db
            .upsert_tagbox("karma", &karma, &["^karma$".to_string()])
            .unwrap();

        let mut factory = TagboxFactory::default();
        factory.register("broken", build_broken);
        factory.register("karma", crate::tagbox::DefaultTagbox::construct);
        (SiteContext::with_factory(db, factory), w, b, k)
    }

    #[test]
    fn test_plan_by_entity_type() {
        let (site, w, b, _) = site();
        let events = vec![tag(1, 10, 100, 5), tag(2, 11, 100, 5), tag(3, 99, 100, 5)];
        let plan = site.router().plan(EventKind::Creation, &events).unwrap();

        let ids = |id: i64| -> Vec<Option<i64>> { plan[&id].iter().map(|e| e.tag_id).collect() };
        assert_eq!(ids(w), vec![Some(1)]);
        assert_eq!(ids(b), vec![Some(1), Some(2)]);
        assert_eq!(plan.len(), 2);
    }

    #[test]
    fn test_plan_user_changes_by_key() {
        let (site, _, _, k) = site();
        let mut karma = tag(0, 0, 100, 0);
        karma.attr_key = Some("karma".to_string());
        karma.user_change_id = Some(1);
        let mut signature = karma.clone();
        signature.attr_key = Some("signature".to_string());
        signature.user_change_id = Some(2);

        let plan = site
            .router()
            .plan(EventKind::UserChange, &[karma, signature])
            .unwrap();
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[&k].len(), 1);
        assert_eq!(plan[&k][0].user_change_id, Some(1));
    }

    #[test]
    fn test_failures_are_isolated() {
        let (site, w, b, _) = site();
        let events = vec![tag(1, 10, 100, 5), tag(2, 10, 101, 5), tag(3, 10, 102, 5)];

        let report = site.router().route(EventKind::Creation, &events).unwrap();
        assert_eq!(report.delivered.get(&w), Some(&3));
        assert!(report.failed.contains(&b));
        assert!(site.registry().is_disabled(b));

        // weight 2 x three unit contributions
        let top = site
            .db()
            .top_affected(&AggregateQuery::new(10, 0.0))
            .unwrap();
        assert_eq!(top.len(), 1);
        assert_eq!((top[0].tagbox_id, top[0].affected_id), (w, 10));
        assert_eq!(top[0].sum_weighted_importance, 6.0);

        // a disabled tagbox is no longer planned
        let plan = site.router().plan(EventKind::Creation, &events).unwrap();
        assert!(!plan.contains_key(&b));
    }

    #[test]
    fn test_deliver_advances_watermark_without_events() {
        let (site, w, _, _) = site();
        let appended = site
            .router()
            .deliver(w, EventKind::Creation, Vec::new(), Some((WatermarkKind::Event, 12)))
            .unwrap();
        assert_eq!(appended, 0);
        let marks = site.db().get_tagbox_watermarks(w).unwrap().unwrap();
        assert_eq!(marks.last_event_id_logged, 12);
        assert!(marks.last_run_completed_at.is_none());
    }
}
