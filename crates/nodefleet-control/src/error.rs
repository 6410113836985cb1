//! Cycle error taxonomy.

use nodefleet_lifecycle::LifecycleError;
use nodefleet_metrics::MetricsError;
use nodefleet_state::StateError;
use thiserror::Error;

pub type CycleResult<T> = Result<T, CycleError>;

#[derive(Debug, Error)]
pub enum CycleError {
    /// Another invocation holds the cluster lock. Expected under
    /// overlapping ticks; not worth more than a debug line.
    #[error("lock on {cluster_id} held by {holder_id} until {expires_at}")]
    LockContention {
        cluster_id: String,
        holder_id: String,
        expires_at: u64,
    },

    /// A conditional state write lost the race. The next tick re-reads.
    #[error("stale cluster state: {0}")]
    StaleState(#[source] StateError),

    /// No snapshot this tick; the cycle did nothing.
    #[error("metrics unavailable: {0}")]
    MetricsUnavailable(#[from] MetricsError),

    /// Not a single requested node came up. The recorded node count was
    /// left at its pre-attempt value.
    #[error("provisioning failed: {failed_creates} create(s) failed, {not_ready} node(s) never became ready")]
    ProvisioningFailure { failed_creates: u32, not_ready: u32 },

    #[error("coordination store unavailable: {0}")]
    CoordinationStoreUnavailable(#[source] StateError),

    #[error("cluster size invariant: {0}")]
    Invariant(String),

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
}

impl CycleError {
    pub fn is_contention(&self) -> bool {
        matches!(self, CycleError::LockContention { .. })
    }
}

impl From<StateError> for CycleError {
    fn from(err: StateError) -> Self {
        match err {
            StateError::Conflict { .. } => CycleError::StaleState(err),
            StateError::Invariant(reason) => CycleError::Invariant(reason),
            other => CycleError::CoordinationStoreUnavailable(other),
        }
    }
}
