//! Error types for the coordination store.

use thiserror::Error;

/// Result type alias for state store operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur during state store operations.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    #[error("coordination store unavailable: {0}")]
    Unavailable(String),

    /// Optimistic update lost the race; re-read and re-evaluate.
    #[error("version conflict on {cluster_id}: expected {expected}, found {found}")]
    Conflict {
        cluster_id: String,
        expected: u64,
        found: u64,
    },

    /// The write would break a cluster-size invariant.
    #[error("invariant violated: {0}")]
    Invariant(String),
}

impl StateError {
    /// True when the store itself could not be reached or used, as opposed
    /// to a logical rejection of the write.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            StateError::Open(_)
                | StateError::Transaction(_)
                | StateError::Table(_)
                | StateError::Read(_)
                | StateError::Write(_)
                | StateError::Unavailable(_)
        )
    }
}
