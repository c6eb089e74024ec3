//! Per-tagbox event filter.
//!
//! Stages run in a fixed order: active-only, tag-name allow-list, entity-type
//! allow-list. A stage whose restriction is unset is skipped entirely.

use std::collections::BTreeSet;

use crate::catalog::EntityTypeCatalog;
use crate::error::Result;
use crate::models::{FilterSettings, TagEvent};

pub fn apply(
    filters: &FilterSettings,
    catalog: &dyn EntityTypeCatalog,
    events: Vec<TagEvent>,
) -> Result<Vec<TagEvent>> {
    let mut events = events;
    if filters.active_only {
        events = active_only(events);
    }
    if let Some(allowed) = &filters.tag_names {
        events = with_tag_names(events, allowed);
    }
    if let Some(allowed) = &filters.entity_types {
        events = with_entity_types(events, allowed, catalog)?;
    }
    Ok(events)
}

/// Drop creation records whose tag has since been deactivated. Deactivation
/// records themselves are kept: they are how an active-only tagbox learns
/// that a tag it counted went away.
pub fn active_only(events: Vec<TagEvent>) -> Vec<TagEvent> {
    events
        .into_iter()
        .filter(|e| !e.deactivated || e.deactivation_id.is_some())
        .collect()
}

pub fn with_tag_names(events: Vec<TagEvent>, allowed: &BTreeSet<i64>) -> Vec<TagEvent> {
    events
        .into_iter()
        .filter(|e| e.tag_name_id.is_some_and(|n| allowed.contains(&n)))
        .collect()
}

/// Keep events whose entity has an allowed type. Types are resolved with one
/// batched catalog lookup; entities the catalog does not know are dropped.
pub fn with_entity_types(
    events: Vec<TagEvent>,
    allowed: &BTreeSet<i64>,
    catalog: &dyn EntityTypeCatalog,
) -> Result<Vec<TagEvent>> {
    let ids: BTreeSet<i64> = events.iter().filter_map(|e| e.entity_id).collect();
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let ids: Vec<i64> = ids.into_iter().collect();
    let types = catalog.entity_types_of(&ids)?;
    Ok(events
        .into_iter()
        .filter(|e| {
            e.entity_id
                .and_then(|id| types.get(&id))
                .is_some_and(|t| allowed.contains(t))
        })
        .collect())
}
