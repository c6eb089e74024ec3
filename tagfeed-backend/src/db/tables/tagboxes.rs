//! Database operations for the tagboxes table
//! One row per distinct tagbox name. Settings are cacheable; the watermark
//! columns are always read fresh.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashMap};
use std::str::FromStr;

use crate::db::{from_db_time, to_db_time, Database};
use crate::error::{FeedError, Result};
use crate::models::{
    AffectedType, FilterSettings, TagboxSettings, TagboxSpec, WatermarkKind, Watermarks,
};

/// Settings that live in the JSON `options` column.
#[derive(Debug, Default, Serialize, Deserialize)]
struct StoredOptions {
    #[serde(default)]
    nosy_entity_types: BTreeSet<i64>,
    #[serde(default)]
    nosy_all_types: bool,
    #[serde(default)]
    filters: FilterSettings,
    #[serde(default)]
    config: Map<String, Value>,
}

/// Raw tagbox row, before its settings are validated.
#[derive(Debug, Clone)]
pub struct TagboxRow {
    pub id: i64,
    pub name: String,
    pub kind: String,
    pub affected_type: String,
    pub weight: f64,
    pub options: String,
    pub interest_regexes: String,
}

impl TagboxRow {
    /// Decode the row into a constructible spec. Malformed rows are configuration errors.
    pub fn into_spec(self) -> Result<TagboxSpec> {
        let affected_type = AffectedType::from_str(&self.affected_type).map_err(|_| {
            FeedError::config(&self.name, format!("unknown affected_type '{}'", self.affected_type))
        })?;
        let options: StoredOptions = serde_json::from_str(&self.options)
            .map_err(|e| FeedError::config(&self.name, format!("bad options: {}", e)))?;
        let interest_regexes: Vec<String> = serde_json::from_str(&self.interest_regexes)
            .map_err(|e| FeedError::config(&self.name, format!("bad interest_regexes: {}", e)))?;

        Ok(TagboxSpec {
            id: self.id,
            name: self.name,
            settings: TagboxSettings {
                kind: self.kind,
                affected_type,
                nosy_entity_types: options.nosy_entity_types,
                nosy_all_types: options.nosy_all_types,
                weight: self.weight,
                filters: options.filters,
                config: options.config,
            },
            interest_regexes,
        })
    }
}

impl Database {
    /// Register a tagbox, or update the settings of an existing one with the
    /// same name. The id and the watermarks of an existing row never change.
    pub fn upsert_tagbox(
        &self,
        name: &str,
        settings: &TagboxSettings,
        interest_regexes: &[String],
    ) -> Result<i64> {
        let options = serde_json::to_string(&StoredOptions {
            nosy_entity_types: settings.nosy_entity_types.clone(),
            nosy_all_types: settings.nosy_all_types,
            filters: settings.filters.clone(),
            config: settings.config.clone(),
        })?;
        let regexes = serde_json::to_string(interest_regexes)?;
        let now = to_db_time(&Utc::now());

        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO tagboxes (name, kind, affected_type, weight, options, interest_regexes, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
             ON CONFLICT(name) DO UPDATE SET
                kind = excluded.kind,
                affected_type = excluded.affected_type,
                weight = excluded.weight,
                options = excluded.options,
                interest_regexes = excluded.interest_regexes,
                updated_at = excluded.updated_at",
            rusqlite::params![
                name,
                settings.kind,
                settings.affected_type.as_ref(),
                settings.weight,
                options,
                regexes,
                now
            ],
        )?;
        let id = conn.query_row("SELECT id FROM tagboxes WHERE name = ?1", [name], |row| {
            row.get(0)
        })?;
        Ok(id)
    }

    /// All tagbox rows (settings only), ordered by id.
    pub fn list_tagbox_rows(&self) -> Result<Vec<TagboxRow>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, name, kind, affected_type, weight, options, interest_regexes
             FROM tagboxes ORDER BY id ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(TagboxRow {
                id: row.get(0)?,
                name: row.get(1)?,
                kind: row.get(2)?,
                affected_type: row.get(3)?,
                weight: row.get(4)?,
                options: row.get(5)?,
                interest_regexes: row.get(6)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Fresh watermark read for one tagbox.
    pub fn get_tagbox_watermarks(&self, tagbox_id: i64) -> Result<Option<Watermarks>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT last_event_id_logged, last_deactivation_id_logged, last_userchange_id_logged,
                    last_run_completed_at
             FROM tagboxes WHERE id = ?1",
        )?;
        let mut rows = stmt.query_map([tagbox_id], row_to_watermarks)?;
        Ok(rows.next().transpose()?)
    }

    /// Fresh watermark read for every tagbox, keyed by id.
    pub fn list_tagbox_watermarks(&self) -> Result<HashMap<i64, Watermarks>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT last_event_id_logged, last_deactivation_id_logged, last_userchange_id_logged,
                    last_run_completed_at, id
             FROM tagboxes",
        )?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, i64>(4)?, row_to_watermarks(row)?)))?;
        Ok(rows.collect::<rusqlite::Result<HashMap<_, _>>>()?)
    }

    /// Advance an event-id watermark. Watermarks never move backwards.
    pub fn advance_tagbox_watermark(&self, tagbox_id: i64, kind: WatermarkKind, value: i64) -> Result<bool> {
        let conn = self.conn()?;
        let changed = advance_watermark(&conn, tagbox_id, kind, value)?;
        Ok(changed)
    }

    pub fn set_tagbox_run_completed(&self, tagbox_id: i64, at: DateTime<Utc>) -> Result<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE tagboxes SET last_run_completed_at = ?1 WHERE id = ?2",
            rusqlite::params![to_db_time(&at), tagbox_id],
        )?;
        Ok(changed > 0)
    }
}

/// Shared with the feeder log so an append and its watermark move commit together.
pub(super) fn advance_watermark(
    conn: &rusqlite::Connection,
    tagbox_id: i64,
    kind: WatermarkKind,
    value: i64,
) -> rusqlite::Result<bool> {
    let column = kind.column();
    let sql = format!(
        "UPDATE tagboxes SET {column} = MAX({column}, ?1) WHERE id = ?2",
        column = column
    );
    let changed = conn.execute(&sql, rusqlite::params![value, tagbox_id])?;
    Ok(changed > 0)
}

fn row_to_watermarks(row: &rusqlite::Row) -> rusqlite::Result<Watermarks> {
    let completed: Option<String> = row.get(3)?;
    Ok(Watermarks {
        last_event_id_logged: row.get(0)?,
        last_deactivation_id_logged: row.get(1)?,
        last_userchange_id_logged: row.get(2)?,
        last_run_completed_at: completed.map(|s| from_db_time(3, &s)).transpose()?,
    })
}
