use std::future::Future;
use std::pin::Pin;

use nodefleet_state::MetricSnapshot;

use crate::error::MetricsResult;

/// Boxed future returned by [`MetricSource::snapshot`].
pub type SnapshotFuture<'a> =
    Pin<Box<dyn Future<Output = MetricsResult<MetricSnapshot>> + Send + 'a>>;

/// Produces one load snapshot per control cycle.
pub trait MetricSource: Send + Sync {
    fn name(&self) -> &'static str;

    /// Sample the cluster's current load, stamped with `now`.
    fn snapshot<'a>(&'a self, cluster_id: &'a str, now: u64) -> SnapshotFuture<'a>;
}
