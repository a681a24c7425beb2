use thiserror::Error;

/// Why a single feed failed. Every variant is caught at feed granularity
/// and turned into a failed outcome; none of them stops sibling feeds.
#[derive(Debug, Error)]
pub enum FeedError {
    #[error("source {source_id}: {reason}")]
    Config { source_id: String, reason: String },

    #[error("fetching {url}: {source}")]
    Fetch {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("fetching {url}: HTTP {status}")]
    Status {
        url: String,
        status: reqwest::StatusCode,
    },

    #[error("malformed feed: {0}")]
    Xml(#[from] quick_xml::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("extraction pool: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),

    #[error("worker task: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("fallback extraction failed: {0}")]
    Fallback(String),
}

impl FeedError {
    pub fn config(source_id: &str, reason: impl Into<String>) -> Self {
        FeedError::Config {
            source_id: source_id.to_string(),
            reason: reason.into(),
        }
    }
}
