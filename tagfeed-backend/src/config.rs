use std::env;
use std::str::FromStr;

/// Environment variable names - single source of truth
pub mod env_vars {
    pub const DATABASE_URL: &str = "TAGFEED_DATABASE_URL";
    pub const TAGBOX_DIR: &str = "TAGFEED_TAGBOX_DIR";
    pub const POLL_INTERVAL_SECS: &str = "TAGFEED_POLL_INTERVAL_SECS";
    // Consumer: how many (tagbox, affected) pairs to rerun per tick, and the
    // weighted importance a pair needs before it is worth a rerun
    pub const RUN_LIMIT: &str = "TAGFEED_RUN_LIMIT";
    pub const MIN_WEIGHTED_SUM: &str = "TAGFEED_MIN_WEIGHTED_SUM";
    pub const INGEST_BATCH: &str = "TAGFEED_INGEST_BATCH";
    pub const POOL_SIZE: &str = "TAGFEED_POOL_SIZE";
}

/// Default values
pub mod defaults {
    pub const DATABASE_URL: &str = "./.db/tagfeed.db";
    pub const TAGBOX_DIR: &str = "tagboxes";
    pub const POLL_INTERVAL_SECS: u64 = 30;
    pub const RUN_LIMIT: usize = 50;
    pub const MIN_WEIGHTED_SUM: f64 = 1.0;
    pub const INGEST_BATCH: usize = 500;
    pub const POOL_SIZE: u32 = 8;
    pub const ENTITY_TYPE_CACHE_CAPACITY: u64 = 100_000;
    /// Ingestion passes per scheduler tick before yielding to the consumer
    pub const INGEST_PASSES_PER_TICK: usize = 20;
}

#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub tagbox_dir: String,
    pub poll_interval_secs: u64,
    pub run_limit: usize,
    pub min_weighted_sum: f64,
    pub ingest_batch: usize,
    pub pool_size: u32,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            database_url: env::var(env_vars::DATABASE_URL)
                .unwrap_or_else(|_| defaults::DATABASE_URL.to_string()),
            tagbox_dir: env::var(env_vars::TAGBOX_DIR)
                .unwrap_or_else(|_| defaults::TAGBOX_DIR.to_string()),
            poll_interval_secs: parse_or(env_vars::POLL_INTERVAL_SECS, defaults::POLL_INTERVAL_SECS),
            run_limit: parse_or(env_vars::RUN_LIMIT, defaults::RUN_LIMIT),
            min_weighted_sum: parse_or(env_vars::MIN_WEIGHTED_SUM, defaults::MIN_WEIGHTED_SUM),
            ingest_batch: parse_or(env_vars::INGEST_BATCH, defaults::INGEST_BATCH),
            pool_size: parse_or(env_vars::POOL_SIZE, defaults::POOL_SIZE),
        }
    }
}

/// Read and parse an env var, falling back to `default` when it is unset or
/// unparseable.
fn parse_or<T: FromStr + ToString>(var: &str, default: T) -> T {
    match env::var(var) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            log::warn!(
                "Invalid value '{}' for {}, using default {}",
                raw,
                var,
                default.to_string()
            );
            default
        }),
        Err(_) => default,
    }
}
