use nodefleet_core::HttpError;
use thiserror::Error;

pub type MetricsResult<T> = Result<T, MetricsError>;

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("metric source is not configured: {0}")]
    NotConfigured(String),

    #[error(transparent)]
    Http(#[from] HttpError),

    #[error("query `{query}` failed: {reason}")]
    Query { query: String, reason: String },

    /// The query succeeded but returned no series.
    #[error("query `{0}` returned no samples")]
    Empty(String),

    #[error("invalid query url: {0}")]
    Url(#[from] url::ParseError),

    #[error("metric source unavailable: {0}")]
    Unavailable(String),
}
