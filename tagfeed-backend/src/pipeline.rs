//! Default feed entry points shared by every tagbox.
//!
//! None of these write to the feeder log: they return contributions and the
//! caller persists them.

use crate::catalog::EntityTypeCatalog;
use crate::error::Result;
use crate::models::{AffectedType, Contribution, SourceRef, TagEvent};
use crate::tagbox::Tagbox;

/// Filter, process, and return contributions for a batch of tag events.
pub fn feed_new_tags<T: Tagbox + ?Sized>(
    tagbox: &T,
    catalog: &dyn EntityTypeCatalog,
    events: Vec<TagEvent>,
) -> Result<Vec<Contribution>> {
    let received = events.len();
    let filtered = tagbox.filter(catalog, events)?;
    pre_hook(tagbox, received, &filtered);
    let contributions = tagbox.process(&filtered);
    post_hook(tagbox, &contributions);
    Ok(contributions)
}

/// Deactivations go through the same path as new tags; downstream code tells
/// them apart by `deactivation_id`.
pub fn feed_deactivated_tags<T: Tagbox + ?Sized>(
    tagbox: &T,
    catalog: &dyn EntityTypeCatalog,
    events: Vec<TagEvent>,
) -> Result<Vec<Contribution>> {
    log::info!(
        "[TAGBOX] {} received {} deactivated tags",
        tagbox.name(),
        events.len()
    );
    tagbox.feed_new_tags(catalog, events)
}

/// User-attribute changes produce nothing unless a tagbox overrides this.
pub fn feed_user_changes<T: Tagbox + ?Sized>(
    tagbox: &T,
    events: Vec<TagEvent>,
) -> Result<Vec<Contribution>> {
    log::info!(
        "[TAGBOX] {} received {} user changes",
        tagbox.name(),
        events.len()
    );
    Ok(Vec::new())
}

/// One unit of importance per event, keyed to the affected dimension and
/// referencing the deactivation if there is one, else the tag.
pub fn default_process(affected_type: AffectedType, events: &[TagEvent]) -> Vec<Contribution> {
    events
        .iter()
        .filter_map(|event| {
            let affected_id = event.key(affected_type)?;
            let source = match (event.deactivation_id, event.tag_id) {
                (Some(deactivation_id), _) => Some(SourceRef::Deactivation(deactivation_id)),
                (None, Some(tag_id)) => Some(SourceRef::Tag(tag_id)),
                (None, None) => None,
            };
            Some(Contribution {
                affected_id,
                importance: 1.0,
                source,
            })
        })
        .collect()
}

fn pre_hook<T: Tagbox + ?Sized>(tagbox: &T, received: usize, filtered: &[TagEvent]) {
    log::debug!(
        "[TAGBOX] {} kept {} of {} events after filtering",
        tagbox.name(),
        filtered.len(),
        received
    );
}

fn post_hook<T: Tagbox + ?Sized>(tagbox: &T, contributions: &[Contribution]) {
    log::debug!(
        "[TAGBOX] {} produced {} contributions",
        tagbox.name(),
        contributions.len()
    );
}
