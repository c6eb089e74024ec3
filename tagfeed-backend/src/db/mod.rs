//! SQLite persistence for tags, tagboxes and the feeder log.
//!
//! `Database` owns the connection pool; each file under `tables/` adds an
//! `impl Database` block for one table group.

pub mod query;
mod sqlite;
pub mod tables;

pub use sqlite::{Database, DbConn};
pub(crate) use sqlite::{from_db_time, to_db_time};
