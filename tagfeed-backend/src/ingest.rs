//! Producer side: drains new tags, deactivations and user changes past each
//! tagbox's watermark into the feeder log.
//!
//! Tagboxes sharing a watermark share one read. Each tagbox's contributions
//! and its watermark move commit in one transaction, so a crash between the
//! two cannot double count or drop a batch. A tagbox that fails keeps its
//! watermark and sees the same events again on the next pass.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::context::SiteContext;
use crate::db::query::TagEventQuery;
use crate::error::Result;
use crate::models::{EventKind, TagEvent, WatermarkKind};
use crate::tagbox::Tagbox;

const KINDS: [EventKind; 3] = [EventKind::Creation, EventKind::Deactivation, EventKind::UserChange];

#[derive(Debug, Clone, Default, PartialEq)]
pub struct IngestReport {
    pub events_read: usize,
    pub entries_appended: usize,
    pub failed: BTreeSet<i64>,
}

impl IngestReport {
    fn absorb(&mut self, other: IngestReport) {
        self.events_read += other.events_read;
        self.entries_appended += other.entries_appended;
        self.failed.extend(other.failed);
    }
}

pub struct Ingestor<'a> {
    ctx: &'a SiteContext,
    batch_size: usize,
}

impl<'a> Ingestor<'a> {
    pub fn new(ctx: &'a SiteContext, batch_size: usize) -> Self {
        Self {
            ctx,
            batch_size: batch_size.max(1),
        }
    }

    /// One bounded read per kind per distinct watermark.
    pub fn run_once(&self) -> Result<IngestReport> {
        let mut report = IngestReport::default();
        for kind in KINDS {
            report.absorb(self.ingest_kind(kind)?);
        }
        Ok(report)
    }

    /// Repeat [`Self::run_once`] until a pass reads nothing, at most `max_passes` times.
    pub fn run_until_idle(&self, max_passes: usize) -> Result<IngestReport> {
        let mut report = IngestReport::default();
        for _ in 0..max_passes {
            let pass = self.run_once()?;
            let idle = pass.events_read == 0;
            report.absorb(pass);
            if idle {
                break;
            }
        }
        Ok(report)
    }

    fn ingest_kind(&self, kind: EventKind) -> Result<IngestReport> {
        let mut report = IngestReport::default();
        let tagboxes = self.ctx.registry().active()?;
        if tagboxes.is_empty() {
            return Ok(report);
        }

        let watermark = WatermarkKind::for_event(kind);
        let marks = self.ctx.db().list_tagbox_watermarks()?;
        let mut groups: BTreeMap<i64, Vec<Arc<dyn Tagbox>>> = BTreeMap::new();
        for tagbox in tagboxes {
            let mark = marks.get(&tagbox.id()).map(|m| watermark.read(m)).unwrap_or(0);
            groups.entry(mark).or_default().push(tagbox);
        }

        let router = self.ctx.router();
        for (mark, group) in groups {
            let events = self.fetch(kind, mark)?;
            let Some(high) = events.iter().filter_map(|e| e.sequence_id()).max() else {
                continue;
            };
            report.events_read += events.len();

            let mut plan = router.plan(kind, &events)?;
            for tagbox in group {
                let id = tagbox.id();
                let batch = plan.remove(&id).unwrap_or_default();
                match router.deliver(id, kind, batch, Some((watermark, high))) {
                    Ok(appended) => report.entries_appended += appended,
                    Err(e) => {
                        router.isolate(id, &e);
                        report.failed.insert(id);
                    }
                }
            }
        }

        if report.events_read > 0 {
            log::info!(
                "[FEEDER] Ingested {} {:?} events: {} entries appended, {} tagboxes failed",
                report.events_read,
                kind,
                report.entries_appended,
                report.failed.len()
            );
        }
        Ok(report)
    }

    fn fetch(&self, kind: EventKind, after: i64) -> Result<Vec<TagEvent>> {
        let db = self.ctx.db();
        match kind {
            EventKind::Creation => db.query_tag_events(
                &TagEventQuery::new()
                    .after_tag_id(after)
                    .limit(self.batch_size),
            ),
            EventKind::Deactivation => db.deactivations_after(after, self.batch_size),
            EventKind::UserChange => db.user_changes_after(after, self.batch_size),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::EntityTypeCatalog;
    use crate::db::Database;
    use crate::error::FeedError;
    use crate::models::{AffectedType, Contribution, TagboxSettings, TagboxSpec};
    use crate::tagbox::testing::settings;
    use crate::tagbox::TagboxFactory;
    use chrono::Utc;
    use std::sync::atomic::{AtomicBool, Ordering};

    static FLAKY_FAILS: AtomicBool = AtomicBool::new(true);

    /// Fails with a store-style error while `FLAKY_FAILS` is set.
    struct Flaky {
        spec: TagboxSpec,
    }

    impl Tagbox for Flaky {
        fn spec(&self) -> &TagboxSpec {
            &self.spec
        }

        fn feed_new_tags(
            &self,
            catalog: &dyn EntityTypeCatalog,
            events: Vec<TagEvent>,
        ) -> Result<Vec<Contribution>> {
            if FLAKY_FAILS.load(Ordering::SeqCst) {
                return Err(FeedError::Io(std::io::Error::other("store unavailable")));
            }
            crate::pipeline::feed_new_tags(self, catalog, events)
        }
    }

    fn build_flaky(spec: TagboxSpec) -> Result<Arc<dyn Tagbox>> {
        Ok(Arc::new(Flaky { spec }))
    }

    fn nosy(kind: &str) -> TagboxSettings {
        let mut s = settings(AffectedType::Object, 1.0);
        s.kind = kind.to_string();
        s.nosy_entity_types = [2].into_iter().collect();
        s
    }

    fn database() -> Arc<Database> {
        let db = Arc::new(Database::new(":memory:").unwrap());
        db.upsert_entity(10, 2, None).unwrap();
        db.upsert_entity(11, 2, None).unwrap();
        db.upsert_entity(12, 7, None).unwrap();
        db
    }

    #[test]
    fn test_ingest_advances_watermarks_once() {
        let db = database();
        let id = db.upsert_tagbox("writeups", &nosy("default"), &[]).unwrap();
        let now = Utc::now();
        db.record_tag(10, 100, 5, now).unwrap();
        db.record_tag(11, 100, 5, now).unwrap();
        let last = db.record_tag(12, 100, 5, now).unwrap();

        let site = SiteContext::new(db.clone());
        let report = site.ingestor(100).run_once().unwrap();
        assert_eq!(report.events_read, 3);
        assert_eq!(report.entries_appended, 2);
        assert_eq!(
            db.get_tagbox_watermarks(id).unwrap().unwrap().last_event_id_logged,
            last
        );

        let again = site.ingestor(100).run_once().unwrap();
        assert_eq!(again, IngestReport::default());
        assert_eq!(db.feeder_entries_for(id, 10).unwrap().len(), 1);
    }

    #[test]
    fn test_batches_until_idle() {
        let db = database();
        let id = db.upsert_tagbox("writeups", &nosy("default"), &[]).unwrap();
        for _ in 0..5 {
            db.record_tag(10, 100, 5, Utc::now()).unwrap();
        }

        let site = SiteContext::new(db.clone());
        let report = site.ingestor(2).run_until_idle(10).unwrap();
        assert_eq!(report.events_read, 5);
        assert_eq!(db.feeder_entries_for(id, 10).unwrap().len(), 5);
    }

    #[test]
    fn test_deactivations_and_user_changes() {
        let db = database();
        let id = db.upsert_tagbox("writeups", &nosy("default"), &[]).unwrap();
        let now = Utc::now();
        let tag = db.record_tag(10, 100, 5, now).unwrap();
        let deactivation = db.deactivate_tag(tag, now).unwrap().unwrap();
        let change = db.record_user_change(100, "karma", now).unwrap();

        let site = SiteContext::new(db.clone());
        site.ingestor(100).run_once().unwrap();

        let entries = db.feeder_entries_for(id, 10).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].tag_id, Some(tag));
        assert_eq!(entries[1].deactivation_id, Some(deactivation));
        assert_eq!(entries[1].tag_id, None);

        let marks = db.get_tagbox_watermarks(id).unwrap().unwrap();
        assert_eq!(marks.last_deactivation_id_logged, deactivation);
        assert_eq!(marks.last_userchange_id_logged, change);
    }

    #[test]
    fn test_failing_tagbox_keeps_its_watermark() {
        let db = database();
        let healthy = db.upsert_tagbox("writeups", &nosy("default"), &[]).unwrap();
        let flaky = db.upsert_tagbox("flaky", &nosy("flaky"), &[]).unwrap();
        let tag = db.record_tag(10, 100, 5, Utc::now()).unwrap();

        let mut factory = TagboxFactory::default();
        factory.register("flaky", build_flaky);
        let site = SiteContext::with_factory(db.clone(), factory);

        FLAKY_FAILS.store(true, Ordering::SeqCst);
        let report = site.ingestor(100).run_once().unwrap();
        assert_eq!(report.failed, [flaky].into_iter().collect());
        assert!(!site.registry().is_disabled(flaky));
        let marks = db.list_tagbox_watermarks().unwrap();
        assert_eq!(marks[&healthy].last_event_id_logged, tag);
        assert_eq!(marks[&flaky].last_event_id_logged, 0);

        FLAKY_FAILS.store(false, Ordering::SeqCst);
        let report = site.ingestor(100).run_once().unwrap();
        assert!(report.failed.is_empty());
        assert_eq!(report.entries_appended, 1);
        assert_eq!(db.feeder_entries_for(healthy, 10).unwrap().len(), 1);
        assert_eq!(db.feeder_entries_for(flaky, 10).unwrap().len(), 1);
    }
}
