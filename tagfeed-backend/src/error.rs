//! Error taxonomy for the scoring-feed core.

/// Errors surfaced by the registry, the feed pipeline and the feeder log.
///
/// "Not found" conditions are never errors: lookups return `Ok(None)`.
#[derive(Debug, thiserror::Error)]
pub enum FeedError {
    /// A declared tagbox could not be constructed or is misconfigured.
    #[error("tagbox {tagbox} is misconfigured: {reason}")]
    Config { tagbox: String, reason: String },

    /// `run` was invoked on a tagbox that does not provide one.
    #[error("tagbox {0} does not implement run()")]
    RunNotImplemented(String),

    /// A caller omitted a required argument.
    #[error("missing argument: {0}")]
    MissingArgument(&'static str),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("invalid interest regex: {0}")]
    Regex(#[from] regex::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("manifest parse error: {0}")]
    Manifest(#[from] toml::de::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl FeedError {
    pub fn config(tagbox: impl Into<String>, reason: impl Into<String>) -> Self {
        FeedError::Config {
            tagbox: tagbox.into(),
            reason: reason.into(),
        }
    }

    /// Configuration errors exclude the tagbox from further dispatch
    /// instead of being retried.
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            FeedError::Config { .. } | FeedError::RunNotImplemented(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, FeedError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_classification() {
        assert!(FeedError::config("karma", "bad weight").is_config());
        assert!(FeedError::RunNotImplemented("karma".into()).is_config());
        assert!(!FeedError::MissingArgument("tagbox_id").is_config());
        assert!(!FeedError::Database(rusqlite::Error::QueryReturnedNoRows).is_config());
    }

    #[test]
    fn test_display() {
        let err = FeedError::config("karma", "weight must be positive");
        assert_eq!(
            err.to_string(),
            "tagbox karma is misconfigured: weight must be positive"
        );
    }
}
