use chrono::{DateTime, SecondsFormat, Utc};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::types::Type;
use std::path::Path;

use crate::config::defaults;
use crate::error::Result;

pub type DbConn = PooledConnection<SqliteConnectionManager>;

pub struct Database {
    pool: Pool<SqliteConnectionManager>,
}

impl Database {
    /// Open (or create) a database. `":memory:"` gives a private in-memory
    /// database behind a single pooled connection.
    pub fn new(database_url: &str) -> Result<Self> {
        Self::with_pool_size(database_url, defaults::POOL_SIZE)
    }

    pub fn with_pool_size(database_url: &str, pool_size: u32) -> Result<Self> {
        let pool = if database_url == ":memory:" {
            let manager = SqliteConnectionManager::memory()
                .with_init(|c| c.execute_batch("PRAGMA foreign_keys=ON;"));
            // The in-memory database lives exactly as long as its one connection
            Pool::builder()
                .max_size(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .build(manager)?
        } else {
            // Create parent directory if it doesn't exist
            if let Some(parent) = Path::new(database_url).parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            let manager = SqliteConnectionManager::file(database_url).with_init(|c| {
                c.execute_batch(
                    "PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON; PRAGMA busy_timeout=5000;",
                )
            });
            Pool::builder().max_size(pool_size.max(1)).build(manager)?
        };

        let db = Self { pool };
        db.init()?;
        Ok(db)
    }

    /// Check out a pooled connection. Never hold one across a call that
    /// checks out another: the in-memory pool has a single connection.
    pub fn conn(&self) -> Result<DbConn> {
        Ok(self.pool.get()?)
    }

    fn init(&self) -> Result<()> {
        let conn = self.conn()?;

        // Entity catalog
        conn.execute(
            "CREATE TABLE IF NOT EXISTS entity_types (
                id INTEGER PRIMARY KEY,
                name TEXT UNIQUE NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS entities (
                id INTEGER PRIMARY KEY,
                entity_type_id INTEGER NOT NULL,
                title TEXT
            )",
            [],
        )?;

        // Tagging events
        conn.execute(
            "CREATE TABLE IF NOT EXISTS tags (
                tag_id INTEGER PRIMARY KEY AUTOINCREMENT,
                entity_id INTEGER NOT NULL,
                user_id INTEGER NOT NULL,
                tag_name_id INTEGER NOT NULL,
                deactivated INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_tags_entity ON tags(entity_id, tag_id)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_tags_user ON tags(user_id, tag_id)",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS tag_deactivations (
                deactivation_id INTEGER PRIMARY KEY AUTOINCREMENT,
                tag_id INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                FOREIGN KEY (tag_id) REFERENCES tags(tag_id)
            )",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS user_changes (
                user_change_id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                attr_key TEXT NOT NULL,
                created_at TEXT NOT NULL
            )",
            [],
        )?;

        // Tagbox registry (one row per distinct name, watermarks inline)
        conn.execute(
            "CREATE TABLE IF NOT EXISTS tagboxes (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT UNIQUE NOT NULL,
                kind TEXT NOT NULL,
                affected_type TEXT NOT NULL,
                weight REAL NOT NULL DEFAULT 1.0,
                options TEXT NOT NULL DEFAULT '{}',
                interest_regexes TEXT NOT NULL DEFAULT '[]',
                last_event_id_logged INTEGER NOT NULL DEFAULT 0,
                last_deactivation_id_logged INTEGER NOT NULL DEFAULT 0,
                last_userchange_id_logged INTEGER NOT NULL DEFAULT 0,
                last_run_completed_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;

        // Append-only contribution log; AUTOINCREMENT keeps entry_id strictly increasing
        conn.execute(
            "CREATE TABLE IF NOT EXISTS feeder_log (
                entry_id INTEGER PRIMARY KEY AUTOINCREMENT,
                tagbox_id INTEGER NOT NULL,
                affected_id INTEGER NOT NULL,
                importance REAL NOT NULL,
                tag_id INTEGER,
                deactivation_id INTEGER,
                user_change_id INTEGER,
                created_at TEXT NOT NULL,
                FOREIGN KEY (tagbox_id) REFERENCES tagboxes(id)
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_feeder_log_pair ON feeder_log(tagbox_id, affected_id, entry_id)",
            [],
        )?;

        Ok(())
    }
}

/// Timestamps are stored as fixed-width RFC 3339 so that text comparison orders them.
pub(crate) fn to_db_time(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn from_db_time(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}
