//! Typed builders for the two dynamic queries of the core: tag-event
//! selection (history fetch, ingestion) and the grouped feeder-log aggregate.
//!
//! Column names come from fixed tables inside this module; every caller
//! supplied value is bound as a parameter, id sets as one JSON array read
//! through `json_each`.

use chrono::{DateTime, Utc};
use rusqlite::types::Value;

use super::to_db_time;
use crate::models::AffectedType;

/// Rendered SQL plus its positional parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct SqlQuery {
    pub sql: String,
    pub params: Vec<Value>,
}

impl SqlQuery {
    pub fn param_refs(&self) -> Vec<&dyn rusqlite::ToSql> {
        self.params.iter().map(|p| p as &dyn rusqlite::ToSql).collect()
    }
}

#[derive(Default)]
struct Binder {
    values: Vec<Value>,
}

impl Binder {
    fn bind(&mut self, value: Value) -> String {
        self.values.push(value);
        format!("?{}", self.values.len())
    }

    fn bind_ids(&mut self, ids: &[i64]) -> String {
        // serde_json cannot fail on a slice of integers
        let json = serde_json::to_string(ids).unwrap_or_else(|_| "[]".to_string());
        self.bind(Value::Text(json))
    }
}

fn tag_column(dimension: AffectedType) -> &'static str {
    match dimension {
        AffectedType::Object => "t.entity_id",
        AffectedType::User => "t.user_id",
    }
}

/// Columns selected by [`TagEventQuery`], in row order.
pub const TAG_EVENT_COLUMNS: &str =
    "t.tag_id, t.entity_id, t.user_id, t.tag_name_id, t.deactivated, t.created_at";

/// Selects tag creation records, ordered by `tag_id` ascending.
#[derive(Debug, Clone, Default)]
pub struct TagEventQuery {
    keyed_by: Option<(AffectedType, Vec<i64>)>,
    max_time: Option<DateTime<Utc>>,
    after_tag_id: Option<i64>,
    limit: Option<usize>,
}

impl TagEventQuery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict to tags whose `dimension` id is in `ids`. An empty set matches nothing.
    pub fn keyed_by(mut self, dimension: AffectedType, ids: impl IntoIterator<Item = i64>) -> Self {
        let mut ids: Vec<i64> = ids.into_iter().collect();
        ids.sort_unstable();
        ids.dedup();
        self.keyed_by = Some((dimension, ids));
        self
    }

    /// Restrict to tags created at or before `max_time`.
    pub fn created_at_most(mut self, max_time: Option<DateTime<Utc>>) -> Self {
        self.max_time = max_time;
        self
    }

    pub fn after_tag_id(mut self, tag_id: i64) -> Self {
        self.after_tag_id = Some(tag_id);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn build(&self) -> SqlQuery {
        let mut binder = Binder::default();
        let mut conditions = Vec::new();

        if let Some((dimension, ids)) = &self.keyed_by {
            if ids.is_empty() {
                conditions.push("1 = 0".to_string());
            } else if let [id] = ids.as_slice() {
                let p = binder.bind(Value::Integer(*id));
                conditions.push(format!("{} = {}", tag_column(*dimension), p));
            } else {
                let p = binder.bind_ids(ids);
                conditions.push(format!(
                    "{} IN (SELECT value FROM json_each({}))",
                    tag_column(*dimension),
                    p
                ));
            }
        }
        if let Some(max_time) = &self.max_time {
            let p = binder.bind(Value::Text(to_db_time(max_time)));
            conditions.push(format!("t.created_at <= {}", p));
        }
        if let Some(after) = self.after_tag_id {
            let p = binder.bind(Value::Integer(after));
            conditions.push(format!("t.tag_id > {}", p));
        }

        let mut sql = format!("SELECT {} FROM tags t", TAG_EVENT_COLUMNS);
        if !conditions.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&conditions.join(" AND "));
        }
        sql.push_str(" ORDER BY t.tag_id ASC");
        if let Some(limit) = self.limit {
            let p = binder.bind(Value::Integer(limit as i64));
            sql.push_str(&format!(" LIMIT {}", p));
        }

        SqlQuery {
            sql,
            params: binder.values,
        }
    }
}

/// Groups the feeder log by `(tagbox_id, affected_id)` and ranks groups by
/// `SUM(importance * tagbox.weight)`.
#[derive(Debug, Clone)]
pub struct AggregateQuery {
    min_weighted_sum: f64,
    limit: usize,
    tagbox_id: Option<i64>,
    affected_id: Option<i64>,
    excluded_tagboxes: Vec<i64>,
}

impl AggregateQuery {
    pub fn new(limit: usize, min_weighted_sum: f64) -> Self {
        Self {
            min_weighted_sum,
            limit,
            tagbox_id: None,
            affected_id: None,
            excluded_tagboxes: Vec::new(),
        }
    }

    pub fn for_pair(mut self, tagbox_id: i64, affected_id: i64) -> Self {
        self.tagbox_id = Some(tagbox_id);
        self.affected_id = Some(affected_id);
        self
    }

    pub fn for_tagbox(mut self, tagbox_id: i64) -> Self {
        self.tagbox_id = Some(tagbox_id);
        self
    }

    pub fn excluding(mut self, tagbox_ids: impl IntoIterator<Item = i64>) -> Self {
        self.excluded_tagboxes.extend(tagbox_ids);
        self
    }

    pub fn build(&self) -> SqlQuery {
        let mut binder = Binder::default();
        let mut conditions = Vec::new();

        if let Some(id) = self.tagbox_id {
            let p = binder.bind(Value::Integer(id));
            conditions.push(format!("f.tagbox_id = {}", p));
        }
        if let Some(id) = self.affected_id {
            let p = binder.bind(Value::Integer(id));
            conditions.push(format!("f.affected_id = {}", p));
        }
        if !self.excluded_tagboxes.is_empty() {
            let p = binder.bind_ids(&self.excluded_tagboxes);
            conditions.push(format!(
                "f.tagbox_id NOT IN (SELECT value FROM json_each({}))",
                p
            ));
        }

        let mut sql = String::from(
            "SELECT f.tagbox_id, f.affected_id, MAX(f.entry_id) AS max_entry_id,
                    SUM(f.importance * t.weight) AS weighted_sum
             FROM feeder_log f JOIN tagboxes t ON t.id = f.tagbox_id",
        );
        if !conditions.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&conditions.join(" AND "));
        }
        let min = binder.bind(Value::Real(self.min_weighted_sum));
        let limit = binder.bind(Value::Integer(self.limit as i64));
        sql.push_str(&format!(
            " GROUP BY f.tagbox_id, f.affected_id
             HAVING weighted_sum >= {}
             ORDER BY weighted_sum DESC, f.tagbox_id ASC, f.affected_id ASC
             LIMIT {}",
            min, limit
        ));

        SqlQuery {
            sql,
            params: binder.values,
        }
    }
}
