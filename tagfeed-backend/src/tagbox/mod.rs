//! Tagbox (scoring module) system.
//!
//! A tagbox watches tagging events for the entity types it is nosy about,
//! turns the ones that survive its filters into importance contributions,
//! and later recomputes a score for an affected object or user. Tagboxes are
//! declared by `*.toml` manifests, registered as rows in the `tagboxes`
//! table, and constructed by kind through a [`TagboxFactory`].

pub mod default;
pub mod loader;
pub mod manifest;
pub mod registry;
pub mod tag_count;

use chrono::{DateTime, Utc};
use regex::Regex;

use crate::catalog::EntityTypeCatalog;
use crate::error::{FeedError, Result};
use crate::filter;
use crate::history::TagHistoryFetcher;
use crate::models::{Contribution, TagEvent, TagboxSettings, TagboxSpec};
use crate::pipeline;

pub use default::DefaultTagbox;
pub use registry::{TagboxConstructor, TagboxFactory, TagboxRegistry};
pub use tag_count::TagCountTagbox;

/// What a tagbox's `run` has access to.
pub struct RunContext<'a> {
    pub history: &'a TagHistoryFetcher,
    pub now: DateTime<Utc>,
}

/// Result of recomputing one affected entity.
#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome {
    pub score: f64,
    pub events_considered: usize,
}

/// Trait that all tagboxes implement.
///
/// Only `spec` is required. Every stage has a default that delegates to the
/// free functions in [`crate::filter`] and [`crate::pipeline`], so an
/// implementation overrides exactly the stages it needs and can still call
/// the default from its override.
pub trait Tagbox: Send + Sync {
    fn spec(&self) -> &TagboxSpec;

    fn id(&self) -> i64 {
        self.spec().id
    }

    fn name(&self) -> &str {
        &self.spec().name
    }

    fn settings(&self) -> &TagboxSettings {
        &self.spec().settings
    }

    /// Narrow a batch to the events this tagbox cares about.
    fn filter(&self, catalog: &dyn EntityTypeCatalog, events: Vec<TagEvent>) -> Result<Vec<TagEvent>> {
        filter::apply(&self.settings().filters, catalog, events)
    }

    /// Turn filtered events into contributions.
    fn process(&self, events: &[TagEvent]) -> Vec<Contribution> {
        pipeline::default_process(self.settings().affected_type, events)
    }

    fn feed_new_tags(&self, catalog: &dyn EntityTypeCatalog, events: Vec<TagEvent>) -> Result<Vec<Contribution>> {
        pipeline::feed_new_tags(self, catalog, events)
    }

    fn feed_deactivated_tags(
        &self,
        catalog: &dyn EntityTypeCatalog,
        events: Vec<TagEvent>,
    ) -> Result<Vec<Contribution>> {
        pipeline::feed_deactivated_tags(self, catalog, events)
    }

    fn feed_user_changes(
        &self,
        _catalog: &dyn EntityTypeCatalog,
        events: Vec<TagEvent>,
    ) -> Result<Vec<Contribution>> {
        pipeline::feed_user_changes(self, events)
    }

    /// Recompute the score of one affected entity. Must be supplied per kind.
    fn run(&self, _ctx: &RunContext<'_>, _affected_id: i64) -> Result<RunOutcome> {
        Err(FeedError::RunNotImplemented(self.name().to_string()))
    }
}

/// Reject settings no tagbox can work with.
pub fn validate_spec(spec: &TagboxSpec) -> Result<()> {
    validate_parts(&spec.name, spec.settings.weight, &spec.interest_regexes)
}

pub(crate) fn validate_parts(name: &str, weight: f64, interest_regexes: &[String]) -> Result<()> {
    if !weight.is_finite() || weight <= 0.0 {
        return Err(FeedError::config(
            name,
            format!("weight must be a positive number, got {}", weight),
        ));
    }
    for pattern in interest_regexes {
        Regex::new(pattern).map_err(|e| {
            FeedError::config(name, format!("invalid interest regex '{}': {}", pattern, e))
        })?;
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod testing {
    //! Fixtures shared by the tagbox, pipeline and scheduler tests.

    use super::*;
    use crate::models::{AffectedType, FilterSettings};
    use serde_json::Map;

    pub fn settings(affected_type: AffectedType, weight: f64) -> TagboxSettings {
        TagboxSettings {
            kind: "default".to_string(),
            affected_type,
            nosy_entity_types: Default::default(),
            nosy_all_types: false,
            weight,
            filters: FilterSettings::default(),
            config: Map::new(),
        }
    }

    pub fn spec(id: i64, name: &str, settings: TagboxSettings) -> TagboxSpec {
        TagboxSpec {
            id,
            name: name.to_string(),
            settings,
            interest_regexes: Vec::new(),
        }
    }

    pub fn tag(tag_id: i64, entity_id: i64, user_id: i64, tag_name_id: i64) -> TagEvent {
        TagEvent {
            tag_id: Some(tag_id),
            entity_id: Some(entity_id),
            user_id: Some(user_id),
            tag_name_id: Some(tag_name_id),
            deactivated: false,
            created_at: Utc::now(),
            deactivation_id: None,
            user_change_id: None,
            attr_key: None,
            entity: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::models::AffectedType;

    #[test]
    fn test_validate_weight() {
        let ok = spec(1, "ok", settings(AffectedType::Object, 0.5));
        assert!(validate_spec(&ok).is_ok());

        for bad in [0.0, -1.0, f64::NAN, f64::INFINITY] {
            let s = spec(1, "bad", settings(AffectedType::Object, bad));
            assert!(validate_spec(&s).unwrap_err().is_config());
        }
    }

    #[test]
    fn test_validate_regexes() {
        let mut s = spec(1, "karma", settings(AffectedType::User, 1.0));
        s.interest_regexes = vec!["^karma$".to_string(), "(".to_string()];
        let err = validate_spec(&s).unwrap_err();
        assert!(err.is_config());
        assert!(err.to_string().contains("invalid interest regex"));
    }

    #[test]
    fn test_default_run_is_not_implemented() {
        let db = std::sync::Arc::new(crate::db::Database::new(":memory:").unwrap());
        let history = TagHistoryFetcher::new(db.clone(), db.clone(), db);
        let tagbox = DefaultTagbox::new(spec(3, "plain", settings(AffectedType::Object, 1.0)));
        let ctx = RunContext {
            history: &history,
            now: Utc::now(),
        };
        let err = tagbox.run(&ctx, 10).unwrap_err();
        assert!(matches!(err, FeedError::RunNotImplemented(ref name) if name == "plain"));
        assert!(err.is_config());
    }
}
