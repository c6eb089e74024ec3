//! Tagbox kind `tag_count`: scores an affected entity by how many active
//! tags its (optionally hop-expanded) history holds.
//!
//! Config:
//! - `hops` (integer, 0..=3, default 0): extra user/object hops to expand

use std::sync::Arc;

use serde_json::Value;

use crate::error::{FeedError, Result};
use crate::history::HistoryOptions;
use crate::models::TagboxSpec;

use super::{RunContext, RunOutcome, Tagbox};

/// Hop expansion fans out quickly; keep it shallow.
pub const MAX_HOPS: u32 = 3;

pub struct TagCountTagbox {
    spec: TagboxSpec,
    hops: u32,
}

impl TagCountTagbox {
    pub fn new(spec: TagboxSpec) -> Result<Self> {
        let hops = match spec.settings.config.get("hops") {
            None => 0,
            Some(Value::Number(n)) => n
                .as_u64()
                .filter(|h| *h <= MAX_HOPS as u64)
                .ok_or_else(|| {
                    FeedError::config(
                        &spec.name,
                        format!("hops must be an integer between 0 and {}, got {}", MAX_HOPS, n),
                    )
                })? as u32,
            Some(other) => {
                return Err(FeedError::config(
                    &spec.name,
                    format!("hops must be an integer, got {}", other),
                ))
            }
        };
        Ok(Self { spec, hops })
    }

    /// Factory entry for kind `tag_count`.
    pub fn construct(spec: TagboxSpec) -> Result<Arc<dyn Tagbox>> {
        Ok(Arc::new(Self::new(spec)?))
    }

    pub fn hops(&self) -> u32 {
        self.hops
    }
}

impl Tagbox for TagCountTagbox {
    fn spec(&self) -> &TagboxSpec {
        &self.spec
    }

    fn run(&self, ctx: &RunContext<'_>, affected_id: i64) -> Result<RunOutcome> {
        let options = HistoryOptions {
            max_time: Some(ctx.now),
        };
        let events = ctx.history.fetch(self, affected_id, self.hops, &options)?;
        let active = events.iter().filter(|e| !e.deactivated).count();
        log::debug!(
            "[TAGBOX] {} scored {} at {} ({} events, {} hops)",
            self.name(),
            affected_id,
            active,
            events.len(),
            self.hops
        );
        Ok(RunOutcome {
            score: active as f64,
            events_considered: events.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::history::TagHistoryFetcher;
    use crate::models::AffectedType;
    use crate::tagbox::testing::{settings, spec};
    use chrono::{Duration, Utc};

    fn with_hops(hops: Value) -> TagboxSpec {
        let mut s = settings(AffectedType::Object, 1.0);
        s.kind = "tag_count".to_string();
        s.config.insert("hops".to_string(), hops);
        spec(1, "counter", s)
    }

    #[test]
    fn test_hops_config() {
        assert_eq!(TagCountTagbox::new(with_hops(Value::from(2))).unwrap().hops(), 2);
        let plain = spec(1, "counter", settings(AffectedType::Object, 1.0));
        assert_eq!(TagCountTagbox::new(plain).unwrap().hops(), 0);

        for bad in [Value::from(4), Value::from(-1), Value::from(1.5), Value::from("one")] {
            let err = TagCountTagbox::new(with_hops(bad)).err().unwrap();
            assert!(err.is_config());
        }
    }

    #[test]
    fn test_run_counts_active_history() {
        let db = Arc::new(Database::new(":memory:").unwrap());
        let earlier = Utc::now() - Duration::minutes(5);
        db.record_tag(10, 100, 1, earlier).unwrap();
        let gone = db.record_tag(10, 101, 1, earlier).unwrap();
        db.record_tag(10, 102, 1, earlier).unwrap();
        db.record_tag(11, 100, 1, earlier).unwrap();
        db.deactivate_tag(gone, earlier).unwrap();

        let history = TagHistoryFetcher::new(db.clone(), db.clone(), db);
        let ctx = RunContext {
            history: &history,
            now: Utc::now(),
        };

        let flat = TagCountTagbox::new(with_hops(Value::from(0))).unwrap();
        let outcome = flat.run(&ctx, 10).unwrap();
        assert_eq!(outcome.events_considered, 3);
        assert_eq!(outcome.score, 2.0);

        // hop 1: every tag made by users 100, 101 and 102
        let hopping = TagCountTagbox::new(with_hops(Value::from(1))).unwrap();
        let outcome = hopping.run(&ctx, 10).unwrap();
        assert_eq!(outcome.events_considered, 4);
        assert_eq!(outcome.score, 3.0);
    }
}
