//! Tagbox manifest parser: reads a `*.toml` declaration into typed structs.
//!
//! A manifest carries everything needed to register a tagbox row: identity,
//! the implementation kind, what it is nosy about, its filters, and a
//! free-form `[config]` table handed to the implementation untouched.

use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::path::Path;

use crate::error::{FeedError, Result};
use crate::models::{AffectedType, FilterSettings, TagboxSettings};

/// Top-level tagbox manifest.
#[derive(Debug, Clone, Deserialize)]
pub struct TagboxManifest {
    pub tagbox: TagboxInfo,
    #[serde(default)]
    pub filters: FilterSettings,
    #[serde(default)]
    pub config: Map<String, Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TagboxInfo {
    pub name: String,
    #[serde(default = "default_kind")]
    pub kind: String,
    pub affected_type: AffectedType,
    #[serde(default = "default_weight")]
    pub weight: f64,
    #[serde(default)]
    pub nosy_entity_types: BTreeSet<i64>,
    /// Shorthand for "every type in the entity catalog"
    #[serde(default)]
    pub nosy_all_types: bool,
    /// Matched against user-attribute change keys, in order
    #[serde(default)]
    pub interest_regexes: Vec<String>,
}

fn default_kind() -> String {
    "default".to_string()
}

fn default_weight() -> f64 {
    1.0
}

impl TagboxManifest {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Parse and validate a manifest from a TOML string.
    pub fn from_str(content: &str) -> Result<Self> {
        let manifest: TagboxManifest = toml::from_str(content)?;
        manifest.validate()?;
        Ok(manifest)
    }

    fn validate(&self) -> Result<()> {
        let info = &self.tagbox;
        if info.name.trim().is_empty() {
            return Err(FeedError::config("<unnamed>", "tagbox name must not be empty"));
        }
        super::validate_parts(&info.name, info.weight, &info.interest_regexes)
    }

    /// Split into what `Database::upsert_tagbox` stores.
    pub fn into_registration(self) -> (String, TagboxSettings, Vec<String>) {
        let TagboxManifest {
            tagbox,
            filters,
            config,
        } = self;
        let settings = TagboxSettings {
            kind: tagbox.kind,
            affected_type: tagbox.affected_type,
            nosy_entity_types: tagbox.nosy_entity_types,
            nosy_all_types: tagbox.nosy_all_types,
            weight: tagbox.weight,
            filters,
            config,
        };
        (tagbox.name, settings, tagbox.interest_regexes)
    }
}
