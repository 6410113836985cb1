//! Lifecycle error types.

use std::time::Duration;

use nodefleet_core::HttpError;
use thiserror::Error;

pub type LifecycleResult<T> = Result<T, LifecycleError>;

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("{operation} on {target} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        target: String,
        after: Duration,
    },

    #[error("{operation} on {target} failed: {reason}")]
    Api {
        operation: &'static str,
        target: String,
        reason: String,
    },

    #[error("node not found: {0}")]
    NotFound(String),

    #[error("termination of {node_id} not confirmed within {after:?}")]
    TerminationUnconfirmed { node_id: String, after: Duration },

    /// The cluster lock was lost before a node mutation.
    #[error("lease lost before mutating {0}")]
    LeaseLost(String),

    #[error("command `{command}` failed: {reason}")]
    Command { command: String, reason: String },

    #[error(transparent)]
    Http(#[from] HttpError),
}

impl LifecycleError {
    pub(crate) fn api(
        operation: &'static str,
        target: impl Into<String>,
        reason: impl ToString,
    ) -> Self {
        LifecycleError::Api {
            operation,
            target: target.into(),
            reason: reason.to_string(),
        }
    }
}
