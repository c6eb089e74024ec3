//! Database operations for entity_types and entities
//! Backs the entity-type catalog and the metadata enricher.

use std::collections::{BTreeSet, HashMap};

use crate::db::Database;
use crate::error::Result;
use crate::models::EntityMeta;

impl Database {
    pub fn upsert_entity_type(&self, id: i64, name: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO entity_types (id, name) VALUES (?1, ?2)
             ON CONFLICT(id) DO UPDATE SET name = excluded.name",
            rusqlite::params![id, name],
        )?;
        Ok(())
    }

    pub fn upsert_entity(&self, id: i64, entity_type_id: i64, title: Option<&str>) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO entities (id, entity_type_id, title) VALUES (?1, ?2, ?3)
             ON CONFLICT(id) DO UPDATE SET entity_type_id = excluded.entity_type_id, title = excluded.title",
            rusqlite::params![id, entity_type_id, title],
        )?;
        Ok(())
    }

    pub fn list_entity_type_ids(&self) -> Result<BTreeSet<i64>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT id FROM entity_types ORDER BY id")?;
        let rows = stmt.query_map([], |row| row.get::<_, i64>(0))?;
        Ok(rows.collect::<rusqlite::Result<BTreeSet<_>>>()?)
    }

    /// Batched lookup of entity metadata. Unknown ids are absent from the map.
    pub fn entity_meta_of(&self, entity_ids: &[i64]) -> Result<HashMap<i64, EntityMeta>> {
        if entity_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let ids = serde_json::to_string(entity_ids)?;
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, entity_type_id, title FROM entities
             WHERE id IN (SELECT value FROM json_each(?1))",
        )?;
        let rows = stmt.query_map([ids], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                EntityMeta {
                    entity_type_id: row.get(1)?,
                    title: row.get(2)?,
                },
            ))
        })?;
        Ok(rows.collect::<rusqlite::Result<HashMap<_, _>>>()?)
    }
}
