//! Database operations for the feeder_log table
//! Append-only contribution log, the weighted top-N aggregate, and
//! bounded compaction.

use chrono::Utc;

use super::tagboxes::advance_watermark;
use crate::db::query::AggregateQuery;
use crate::db::{from_db_time, to_db_time, Database};
use crate::error::Result;
use crate::models::{AffectedAggregate, Contribution, FeederLogEntry, SourceRef, WatermarkKind};

/// Importance of a forced recalculation entry. Large enough that, times any
/// valid tagbox weight, it outranks organic accumulation.
pub const FORCE_RECALC_IMPORTANCE: f64 = 1.0e12;

fn source_columns(source: Option<SourceRef>) -> (Option<i64>, Option<i64>, Option<i64>) {
    match source {
        Some(SourceRef::Tag(id)) => (Some(id), None, None),
        Some(SourceRef::Deactivation(id)) => (None, Some(id), None),
        Some(SourceRef::UserChange(id)) => (None, None, Some(id)),
        None => (None, None, None),
    }
}

fn insert_entry(
    conn: &rusqlite::Connection,
    tagbox_id: i64,
    contribution: &Contribution,
    now: &str,
) -> rusqlite::Result<i64> {
    let (tag_id, deactivation_id, user_change_id) = source_columns(contribution.source);
    conn.execute(
        "INSERT INTO feeder_log (tagbox_id, affected_id, importance, tag_id, deactivation_id, user_change_id, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        rusqlite::params![
            tagbox_id,
            contribution.affected_id,
            contribution.importance,
            tag_id,
            deactivation_id,
            user_change_id,
            now
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

impl Database {
    /// Append one immutable entry. Returns its `entry_id`.
    pub fn append_feeder_entry(&self, tagbox_id: i64, contribution: &Contribution) -> Result<i64> {
        let conn = self.conn()?;
        let now = to_db_time(&Utc::now());
        Ok(insert_entry(&conn, tagbox_id, contribution, &now)?)
    }

    /// Append a batch of contributions and, in the same transaction,
    /// optionally advance one of the tagbox's ingestion watermarks.
    pub fn append_feeder_entries(
        &self,
        tagbox_id: i64,
        contributions: &[Contribution],
        advance: Option<(WatermarkKind, i64)>,
    ) -> Result<usize> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let now = to_db_time(&Utc::now());
        for contribution in contributions {
            insert_entry(&tx, tagbox_id, contribution, &now)?;
        }
        if let Some((kind, value)) = advance {
            advance_watermark(&tx, tagbox_id, kind, value)?;
        }
        tx.commit()?;
        Ok(contributions.len())
    }

    /// Insert a synthetic entry that forces a re-run of `(tagbox, affected)`.
    pub fn force_recalc(&self, tagbox_id: i64, affected_id: i64) -> Result<i64> {
        self.append_feeder_entry(
            tagbox_id,
            &Contribution {
                affected_id,
                importance: FORCE_RECALC_IMPORTANCE,
                source: None,
            },
        )
    }

    /// Rank `(tagbox, affected)` groups by summed weighted importance.
    pub fn top_affected(&self, query: &AggregateQuery) -> Result<Vec<AffectedAggregate>> {
        let query = query.build();
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&query.sql)?;
        let rows = stmt.query_map(query.param_refs().as_slice(), |row| {
            Ok(AffectedAggregate {
                tagbox_id: row.get(0)?,
                affected_id: row.get(1)?,
                max_entry_id: row.get(2)?,
                sum_weighted_importance: row.get(3)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Delete every entry of `(tagbox, affected)` with `entry_id <= max_entry_id`
    /// and stamp the tagbox's `last_run_completed_at`. Entries appended after
    /// the aggregate snapshot have larger ids and survive. Returns the number
    /// of entries removed.
    pub fn mark_run_complete(&self, tagbox_id: i64, affected_id: i64, max_entry_id: i64) -> Result<usize> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let deleted = tx.execute(
            "DELETE FROM feeder_log WHERE tagbox_id = ?1 AND affected_id = ?2 AND entry_id <= ?3",
            rusqlite::params![tagbox_id, affected_id, max_entry_id],
        )?;
        tx.execute(
            "UPDATE tagboxes SET last_run_completed_at = ?1 WHERE id = ?2",
            rusqlite::params![to_db_time(&Utc::now()), tagbox_id],
        )?;
        tx.commit()?;
        Ok(deleted)
    }

    /// Current log entries of one pair, oldest first.
    pub fn feeder_entries_for(&self, tagbox_id: i64, affected_id: i64) -> Result<Vec<FeederLogEntry>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT entry_id, tagbox_id, affected_id, importance, tag_id, deactivation_id, user_change_id, created_at
             FROM feeder_log WHERE tagbox_id = ?1 AND affected_id = ?2
             ORDER BY entry_id ASC",
        )?;
        let rows = stmt.query_map(rusqlite::params![tagbox_id, affected_id], |row| {
            let created_at: String = row.get(7)?;
            Ok(FeederLogEntry {
                entry_id: row.get(0)?,
                tagbox_id: row.get(1)?,
                affected_id: row.get(2)?,
                importance: row.get(3)?,
                tag_id: row.get(4)?,
                deactivation_id: row.get(5)?,
                user_change_id: row.get(6)?,
                created_at: from_db_time(7, &created_at)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AffectedType, FilterSettings, TagboxSettings};
    use serde_json::Map;

    fn tagbox(db: &Database, name: &str, weight: f64) -> i64 {
        let settings = TagboxSettings {
            kind: "default".to_string(),
            affected_type: AffectedType::Object,
            nosy_entity_types: Default::default(),
            nosy_all_types: false,
            weight,
            filters: FilterSettings::default(),
            config: Map::new(),
        };
        db.upsert_tagbox(name, &settings, &[]).unwrap()
    }

    fn unit(affected_id: i64, tag_id: i64) -> Contribution {
        Contribution {
            affected_id,
            importance: 1.0,
            source: Some(SourceRef::Tag(tag_id)),
        }
    }

    #[test]
    fn test_weighted_sum_for_three_tags() {
        let db = Database::new(":memory:").unwrap();
        let m = tagbox(&db, "m", 2.0);
        for tag in 1..=3 {
            db.append_feeder_entry(m, &unit(50, tag)).unwrap();
        }

        let top = db.top_affected(&AggregateQuery::new(10, 0.0)).unwrap();
        assert_eq!(top.len(), 1);
        assert_eq!(top[0].tagbox_id, m);
        assert_eq!(top[0].affected_id, 50);
        assert_eq!(top[0].sum_weighted_importance, 6.0);
        assert_eq!(db.feeder_entries_for(m, 50).unwrap().len(), 3);
    }

    #[test]
    fn test_sum_is_independent_of_insertion_order() {
        let importances = [0.5, 4.0, 1.5, 2.0];
        let mut sums = Vec::new();
        for order in [[0, 1, 2, 3], [3, 2, 1, 0], [2, 0, 3, 1]] {
            let db = Database::new(":memory:").unwrap();
            let m = tagbox(&db, "m", 3.0);
            for i in order {
                db.append_feeder_entry(
                    m,
                    &Contribution {
                        affected_id: 7,
                        importance: importances[i],
                        source: None,
                    },
                )
                .unwrap();
            }
            let top = db.top_affected(&AggregateQuery::new(1, 0.0)).unwrap();
            sums.push(top[0].sum_weighted_importance);
        }
        assert!(sums.iter().all(|s| (*s - 24.0).abs() < 1e-9));
    }

    #[test]
    fn test_threshold_order_and_limit() {
        let db = Database::new(":memory:").unwrap();
        let a = tagbox(&db, "a", 1.0);
        let b = tagbox(&db, "b", 5.0);
        db.append_feeder_entry(a, &unit(1, 1)).unwrap();
        db.append_feeder_entry(a, &unit(2, 2)).unwrap();
        db.append_feeder_entry(a, &unit(2, 3)).unwrap();
        db.append_feeder_entry(b, &unit(1, 4)).unwrap();

        let top = db.top_affected(&AggregateQuery::new(10, 2.0)).unwrap();
        let pairs: Vec<_> = top.iter().map(|g| (g.tagbox_id, g.affected_id)).collect();
        assert_eq!(pairs, vec![(b, 1), (a, 2)]);

        let capped = db.top_affected(&AggregateQuery::new(1, 0.0)).unwrap();
        assert_eq!(capped.len(), 1);
        assert_eq!((capped[0].tagbox_id, capped[0].affected_id), (b, 1));

        let excluded = db
            .top_affected(&AggregateQuery::new(10, 0.0).excluding([b]))
            .unwrap();
        assert!(excluded.iter().all(|g| g.tagbox_id == a));
    }

    #[test]
    fn test_top_affected_is_idempotent() {
        let db = Database::new(":memory:").unwrap();
        let a = tagbox(&db, "a", 1.0);
        for (affected, tag) in [(1, 1), (2, 2), (1, 3), (3, 4)] {
            db.append_feeder_entry(a, &unit(affected, tag)).unwrap();
        }
        let first = db.top_affected(&AggregateQuery::new(10, 0.0)).unwrap();
        let second = db.top_affected(&AggregateQuery::new(10, 0.0)).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_force_recalc_surfaces_first() {
        let db = Database::new(":memory:").unwrap();
        let heavy = tagbox(&db, "heavy", 100.0);
        let light = tagbox(&db, "light", 0.01);
        for tag in 0..50 {
            db.append_feeder_entry(heavy, &unit(1, tag)).unwrap();
        }
        let forced = db.force_recalc(light, 99).unwrap();

        let top = db.top_affected(&AggregateQuery::new(1, 1.0)).unwrap();
        assert_eq!((top[0].tagbox_id, top[0].affected_id), (light, 99));
        assert_eq!(top[0].max_entry_id, forced);

        let entry = &db.feeder_entries_for(light, 99).unwrap()[0];
        assert_eq!(entry.tag_id, None);
        assert_eq!(entry.deactivation_id, None);
        assert_eq!(entry.user_change_id, None);
    }

    #[test]
    fn test_compaction_respects_snapshot_bound() {
        let db = Database::new(":memory:").unwrap();
        let m = tagbox(&db, "m", 1.0);
        let other = tagbox(&db, "other", 1.0);
        db.append_feeder_entry(m, &unit(5, 1)).unwrap();
        db.append_feeder_entry(m, &unit(5, 2)).unwrap();
        db.append_feeder_entry(other, &unit(5, 3)).unwrap();

        let snapshot = db
            .top_affected(&AggregateQuery::new(10, 0.0).for_pair(m, 5))
            .unwrap()
            .remove(0);

        // A producer appends after the snapshot was taken
        let late = db.append_feeder_entry(m, &unit(5, 4)).unwrap();
        assert!(late > snapshot.max_entry_id);

        let deleted = db.mark_run_complete(m, 5, snapshot.max_entry_id).unwrap();
        assert_eq!(deleted, 2);

        let remaining = db.feeder_entries_for(m, 5).unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].entry_id, late);
        assert!(remaining.iter().all(|e| e.entry_id > snapshot.max_entry_id));

        // Other pairs are untouched
        assert_eq!(db.feeder_entries_for(other, 5).unwrap().len(), 1);
        let marks = db.get_tagbox_watermarks(m).unwrap().unwrap();
        assert!(marks.last_run_completed_at.is_some());
    }

    #[test]
    fn test_batch_append_advances_watermark_atomically() {
        let db = Database::new(":memory:").unwrap();
        let m = tagbox(&db, "m", 1.0);
        let appended = db
            .append_feeder_entries(m, &[unit(1, 10), unit(2, 11)], Some((WatermarkKind::Event, 11)))
            .unwrap();
        assert_eq!(appended, 2);
        assert_eq!(
            db.get_tagbox_watermarks(m).unwrap().unwrap().last_event_id_logged,
            11
        );

        let entry = &db.feeder_entries_for(m, 2).unwrap()[0];
        assert_eq!(entry.tag_id, Some(11));
    }
}
