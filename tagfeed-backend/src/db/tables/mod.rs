//! Database table modules - extend Database with domain-specific methods
//!
//! Each module adds `impl Database` blocks with methods for a specific table group.

mod entities;       // entity_types, entities (entity catalog + metadata)
mod feeder_log;     // feeder_log (append, aggregate, compaction)
mod tag_events;     // tags, tag_deactivations, user_changes
mod tagboxes;       // tagboxes (registry rows + watermarks)

pub use feeder_log::FORCE_RECALC_IMPORTANCE;
pub use tagboxes::TagboxRow;
