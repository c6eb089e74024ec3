//! Database operations for tags, tag_deactivations and user_changes
//! Producers write here; the ingestor and the history fetcher read.

use chrono::{DateTime, Utc};

use crate::db::query::TagEventQuery;
use crate::db::{from_db_time, to_db_time, Database};
use crate::error::Result;
use crate::models::TagEvent;

impl Database {
    /// Record a new tag. Returns its `tag_id`.
    pub fn record_tag(
        &self,
        entity_id: i64,
        user_id: i64,
        tag_name_id: i64,
        created_at: DateTime<Utc>,
    ) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO tags (entity_id, user_id, tag_name_id, deactivated, created_at)
             VALUES (?1, ?2, ?3, 0, ?4)",
            rusqlite::params![entity_id, user_id, tag_name_id, to_db_time(&created_at)],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Deactivate a tag and record the deactivation. Returns the
    /// `deactivation_id`, or `None` if the tag does not exist or is already inactive.
    pub fn deactivate_tag(&self, tag_id: i64, at: DateTime<Utc>) -> Result<Option<i64>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let changed = tx.execute(
            "UPDATE tags SET deactivated = 1 WHERE tag_id = ?1 AND deactivated = 0",
            [tag_id],
        )?;
        if changed == 0 {
            return Ok(None);
        }
        tx.execute(
            "INSERT INTO tag_deactivations (tag_id, created_at) VALUES (?1, ?2)",
            rusqlite::params![tag_id, to_db_time(&at)],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;
        Ok(Some(id))
    }

    /// Record a user-attribute change. Returns its `user_change_id`.
    pub fn record_user_change(&self, user_id: i64, attr_key: &str, at: DateTime<Utc>) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO user_changes (user_id, attr_key, created_at) VALUES (?1, ?2, ?3)",
            rusqlite::params![user_id, attr_key, to_db_time(&at)],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Run a tag-event selection built with [`TagEventQuery`].
    pub fn query_tag_events(&self, query: &TagEventQuery) -> Result<Vec<TagEvent>> {
        let query = query.build();
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&query.sql)?;
        let rows = stmt.query_map(query.param_refs().as_slice(), row_to_tag_event)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Deactivation records past `after_id`, oldest first.
    pub fn deactivations_after(&self, after_id: i64, limit: usize) -> Result<Vec<TagEvent>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT d.deactivation_id, t.tag_id, t.entity_id, t.user_id, t.tag_name_id, d.created_at
             FROM tag_deactivations d JOIN tags t ON t.tag_id = d.tag_id
             WHERE d.deactivation_id > ?1
             ORDER BY d.deactivation_id ASC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(rusqlite::params![after_id, limit as i64], |row| {
            let created_at: String = row.get(5)?;
            Ok(TagEvent {
                tag_id: row.get(1)?,
                entity_id: row.get(2)?,
                user_id: row.get(3)?,
                tag_name_id: row.get(4)?,
                deactivated: true,
                created_at: from_db_time(5, &created_at)?,
                deactivation_id: Some(row.get(0)?),
                user_change_id: None,
                attr_key: None,
                entity: None,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// User-attribute change records past `after_id`, oldest first.
    pub fn user_changes_after(&self, after_id: i64, limit: usize) -> Result<Vec<TagEvent>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT user_change_id, user_id, attr_key, created_at
             FROM user_changes
             WHERE user_change_id > ?1
             ORDER BY user_change_id ASC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(rusqlite::params![after_id, limit as i64], |row| {
            let created_at: String = row.get(3)?;
            Ok(TagEvent {
                tag_id: None,
                entity_id: None,
                user_id: row.get(1)?,
                tag_name_id: None,
                deactivated: false,
                created_at: from_db_time(3, &created_at)?,
                deactivation_id: None,
                user_change_id: Some(row.get(0)?),
                attr_key: row.get(2)?,
                entity: None,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}

fn row_to_tag_event(row: &rusqlite::Row) -> rusqlite::Result<TagEvent> {
    let created_at: String = row.get(5)?;
    Ok(TagEvent {
        tag_id: row.get(0)?,
        entity_id: row.get(1)?,
        user_id: row.get(2)?,
        tag_name_id: row.get(3)?,
        deactivated: row.get::<_, i64>(4)? != 0,
        created_at: from_db_time(5, &created_at)?,
        deactivation_id: None,
        user_change_id: None,
        attr_key: None,
        entity: None,
    })
}
