//! Periodic driver for [`ControlLoop`].

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{error, info};

use crate::cycle::ControlLoop;

impl ControlLoop {
    /// Start a cycle every `interval` until `shutdown` changes.
    ///
    /// Each cycle runs in its own task; ticks never wait for the previous
    /// cycle. In-flight cycles are awaited before returning.
    pub async fn run(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(
            cluster_id = %self.cluster_id(),
            holder = %self.holder_prefix(),
            ?interval,
            "control loop started"
        );

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut in_flight = JoinSet::new();

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let this = Arc::clone(&self);
                    in_flight.spawn(async move {
                        // Outcomes are logged and reported by run_cycle.
                        let _ = this.run_cycle().await;
                    });
                }
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    if let Err(e) = joined {
                        error!(error = %e, "cycle task failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("control loop shutting down");
                    break;
                }
            }
        }

        while let Some(joined) = in_flight.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "cycle task failed");
            }
        }
        info!("control loop stopped");
    }
}
