//! Scoring-feed aggregation core for a tag-based relevance engine.
//!
//! Tagboxes watch tagging events, turn the ones they care about into
//! importance contributions, and rerun scores for the affected objects and
//! users whose accumulated contributions are highest. Everything a site
//! needs hangs off a [`context::SiteContext`].

pub mod catalog;
pub mod config;
pub mod context;
pub mod db;
pub mod error;
pub mod filter;
pub mod history;
pub mod ingest;
pub mod interest;
pub mod models;
pub mod pipeline;
pub mod router;
pub mod scheduler;
pub mod tagbox;

pub use context::SiteContext;
pub use error::{FeedError, Result};
