//! Domain types shared by the registry, the feed pipeline and the feeder log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use strum::{AsRefStr, Display, EnumString};

// =====================================================
// Tagbox configuration
// =====================================================

/// Which dimension of a tag a tagbox scores.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EnumString, Display, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AffectedType {
    /// The tagged object (`entity_id`)
    Object,
    /// The tagging user (`user_id`)
    User,
}

impl AffectedType {
    /// The dimension on the other side of the user/object relation.
    pub fn flipped(self) -> Self {
        match self {
            AffectedType::Object => AffectedType::User,
            AffectedType::User => AffectedType::Object,
        }
    }
}

/// Event filter restrictions. An unset restriction skips its stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FilterSettings {
    /// Keep only tags that are still active
    #[serde(default)]
    pub active_only: bool,
    /// Allow-list of tag name ids
    #[serde(default)]
    pub tag_names: Option<BTreeSet<i64>>,
    /// Allow-list of entity type ids (resolved through the entity catalog)
    #[serde(default)]
    pub entity_types: Option<BTreeSet<i64>>,
}

/// Every non-watermark setting of a tagbox. Safe to cache for the life of a site.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TagboxSettings {
    /// Implementation kind used to construct the tagbox
    pub kind: String,
    pub affected_type: AffectedType,
    /// Entity types this tagbox wants to be notified about
    #[serde(default)]
    pub nosy_entity_types: BTreeSet<i64>,
    /// Notify about every type known to the entity catalog
    #[serde(default)]
    pub nosy_all_types: bool,
    /// Multiplier applied to every contribution this tagbox logs
    pub weight: f64,
    #[serde(default)]
    pub filters: FilterSettings,
    /// Free-form implementation config
    #[serde(default)]
    pub config: Map<String, Value>,
}

/// Per-tagbox progress markers. Never cached: always read from the store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Watermarks {
    pub last_event_id_logged: i64,
    pub last_deactivation_id_logged: i64,
    pub last_userchange_id_logged: i64,
    pub last_run_completed_at: Option<DateTime<Utc>>,
}

/// The event-id watermarks advanced by ingestion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatermarkKind {
    Event,
    Deactivation,
    UserChange,
}

impl WatermarkKind {
    pub(crate) fn column(self) -> &'static str {
        match self {
            WatermarkKind::Event => "last_event_id_logged",
            WatermarkKind::Deactivation => "last_deactivation_id_logged",
            WatermarkKind::UserChange => "last_userchange_id_logged",
        }
    }

    /// The watermark that tracks events of `kind`.
    pub fn for_event(kind: EventKind) -> Self {
        match kind {
            EventKind::Creation => WatermarkKind::Event,
            EventKind::Deactivation => WatermarkKind::Deactivation,
            EventKind::UserChange => WatermarkKind::UserChange,
        }
    }

    pub fn read(self, marks: &Watermarks) -> i64 {
        match self {
            WatermarkKind::Event => marks.last_event_id_logged,
            WatermarkKind::Deactivation => marks.last_deactivation_id_logged,
            WatermarkKind::UserChange => marks.last_userchange_id_logged,
        }
    }
}

/// Everything needed to construct a tagbox implementation.
#[derive(Debug, Clone, PartialEq)]
pub struct TagboxSpec {
    pub id: i64,
    pub name: String,
    pub settings: TagboxSettings,
    pub interest_regexes: Vec<String>,
}

/// Fields a registry read can be projected to. `id` and `name` are always present.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TagboxField {
    Settings,
    InterestRegexes,
    Watermarks,
}

/// A (possibly projected) tagbox as returned by the registry.
#[derive(Debug, Clone, PartialEq)]
pub struct TagboxRecord {
    pub id: i64,
    pub name: String,
    pub settings: Option<TagboxSettings>,
    pub interest_regexes: Option<Vec<String>>,
    pub watermarks: Option<Watermarks>,
}

/// How a caller identifies one tagbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TagboxRef {
    Id(i64),
    Name(String),
}

impl From<i64> for TagboxRef {
    fn from(id: i64) -> Self {
        TagboxRef::Id(id)
    }
}

impl From<&str> for TagboxRef {
    fn from(name: &str) -> Self {
        TagboxRef::Name(name.to_string())
    }
}

// =====================================================
// Tag events
// =====================================================

/// Denormalized entity metadata attached before events leave the history fetcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityMeta {
    pub entity_type_id: i64,
    pub title: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Creation,
    Deactivation,
    UserChange,
}

/// A tag creation, a tag deactivation, or a user-attribute change.
///
/// Deactivation records carry `deactivation_id`; user-change records carry
/// `user_change_id` (and `attr_key`). Creation records carry neither.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TagEvent {
    pub tag_id: Option<i64>,
    pub entity_id: Option<i64>,
    pub user_id: Option<i64>,
    pub tag_name_id: Option<i64>,
    pub deactivated: bool,
    pub created_at: DateTime<Utc>,
    pub deactivation_id: Option<i64>,
    pub user_change_id: Option<i64>,
    /// Changed attribute key (user-change records only)
    pub attr_key: Option<String>,
    #[serde(default)]
    pub entity: Option<EntityMeta>,
}

impl TagEvent {
    pub fn kind(&self) -> EventKind {
        if self.user_change_id.is_some() {
            EventKind::UserChange
        } else if self.deactivation_id.is_some() {
            EventKind::Deactivation
        } else {
            EventKind::Creation
        }
    }

    /// The sequence id ingestion watermarks are compared against.
    pub fn sequence_id(&self) -> Option<i64> {
        match self.kind() {
            EventKind::Creation => self.tag_id,
            EventKind::Deactivation => self.deactivation_id,
            EventKind::UserChange => self.user_change_id,
        }
    }

    /// The id of this event along the given dimension.
    pub fn key(&self, dimension: AffectedType) -> Option<i64> {
        match dimension {
            AffectedType::Object => self.entity_id,
            AffectedType::User => self.user_id,
        }
    }
}

// =====================================================
// Contributions and the feeder log
// =====================================================

/// The record a contribution points back to. Exactly one, never both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum SourceRef {
    Tag(i64),
    Deactivation(i64),
    UserChange(i64),
}

/// One unit of importance produced by a tagbox for one event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contribution {
    pub affected_id: i64,
    pub importance: f64,
    pub source: Option<SourceRef>,
}

/// An immutable row of the append-only feeder log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeederLogEntry {
    pub entry_id: i64,
    pub tagbox_id: i64,
    pub affected_id: i64,
    pub importance: f64,
    pub tag_id: Option<i64>,
    pub deactivation_id: Option<i64>,
    pub user_change_id: Option<i64>,
    pub created_at: DateTime<Utc>,
}

/// Per `(tagbox, affected)` aggregate computed on demand from the feeder log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AffectedAggregate {
    pub tagbox_id: i64,
    pub affected_id: i64,
    /// Compaction bound captured with this snapshot
    pub max_entry_id: i64,
    pub sum_weighted_importance: f64,
}
