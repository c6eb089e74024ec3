//! Tag history reconstruction for `run`.
//!
//! The base query selects every tag keyed by the tagbox's affected dimension.
//! Each extra hop collects the ids of the other dimension seen so far and
//! re-queries by them, so one hop from an object yields every tag made by the
//! users who tagged it. Every hop is time-bounded and re-filtered.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;

use crate::catalog::{EntityTypeCatalog, MetadataEnricher};
use crate::db::query::TagEventQuery;
use crate::db::Database;
use crate::error::{FeedError, Result};
use crate::models::{AffectedType, TagEvent};
use crate::tagbox::{Tagbox, TagboxRegistry};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistoryOptions {
    /// Ignore tags created after this instant
    #[serde(default)]
    pub max_time: Option<DateTime<Utc>>,
}

/// Loosely-typed history request, as received from a caller outside the core.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistoryRequest {
    #[serde(default)]
    pub tagbox_id: Option<i64>,
    pub affected_id: i64,
    #[serde(default)]
    pub extra_hops: u32,
    #[serde(flatten)]
    pub options: HistoryOptions,
}

pub struct TagHistoryFetcher {
    db: Arc<Database>,
    catalog: Arc<dyn EntityTypeCatalog>,
    enricher: Arc<dyn MetadataEnricher>,
}

impl TagHistoryFetcher {
    pub fn new(
        db: Arc<Database>,
        catalog: Arc<dyn EntityTypeCatalog>,
        enricher: Arc<dyn MetadataEnricher>,
    ) -> Self {
        Self {
            db,
            catalog,
            enricher,
        }
    }

    /// Every filtered tag relevant to `affected_id`, expanded `extra_hops`
    /// times across the user/object relation, ordered by `tag_id`.
    pub fn fetch(
        &self,
        tagbox: &dyn Tagbox,
        affected_id: i64,
        extra_hops: u32,
        options: &HistoryOptions,
    ) -> Result<Vec<TagEvent>> {
        let mut dimension = tagbox.settings().affected_type;
        let mut events = self.select(tagbox, dimension, BTreeSet::from([affected_id]), options)?;

        let mut hops_left = extra_hops;
        while hops_left > 0 && !events.is_empty() {
            let next = dimension.flipped();
            let keys: BTreeSet<i64> = events.iter().filter_map(|e| e.key(next)).collect();
            events = self.select(tagbox, next, keys, options)?;
            dimension = next;
            hops_left -= 1;
        }

        self.enricher.attach_metadata(&mut events)?;
        log::debug!(
            "[TAGBOX] {} history for {}: {} events after {} hops",
            tagbox.name(),
            affected_id,
            events.len(),
            extra_hops - hops_left
        );
        Ok(events)
    }

    fn select(
        &self,
        tagbox: &dyn Tagbox,
        dimension: AffectedType,
        keys: BTreeSet<i64>,
        options: &HistoryOptions,
    ) -> Result<Vec<TagEvent>> {
        let query = TagEventQuery::new()
            .keyed_by(dimension, keys)
            .created_at_most(options.max_time);
        let events = self.db.query_tag_events(&query)?;
        tagbox.filter(self.catalog.as_ref(), events)
    }

    /// Serve a [`HistoryRequest`]. A request without a tagbox id is a caller
    /// bug: it is logged loudly and answered with `None`, as is a request
    /// for a tagbox that does not exist.
    pub fn fetch_request(
        &self,
        registry: &TagboxRegistry,
        request: &HistoryRequest,
    ) -> Result<Option<Vec<TagEvent>>> {
        let Some(tagbox_id) = request.tagbox_id else {
            log::warn!(
                "[TAGBOX] History fetch for {} rejected: {}",
                request.affected_id,
                FeedError::MissingArgument("tagbox_id")
            );
            return Ok(None);
        };
        let Some(tagbox) = registry.get(tagbox_id)? else {
            return Ok(None);
        };
        self.fetch(
            tagbox.as_ref(),
            request.affected_id,
            request.extra_hops,
            &request.options,
        )
        .map(Some)
    }
}
