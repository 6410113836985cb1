//! `fleetd simulate`: the real control loop against a simulated cluster.
//!
//! Time is a manual clock advanced one metrics interval per cycle, so a
//! day of load plays out in seconds. Node boots and drains use short real
//! timeouts.

use std::f64::consts::TAU;
use std::sync::Arc;

use nodefleet_control::{BoxFuture, ControlLoop, CycleEvent};
use nodefleet_core::{FleetConfig, HumanDuration, ManualClock, epoch_secs};
use nodefleet_lifecycle::{DrainBehavior, SimulatedCluster};
use nodefleet_metrics::{Reading, ScriptedSource};
use nodefleet_state::StateStore;
use tracing::{debug, info};

/// Synthetic load for cycle `i` of `cycles`: one full wave of CPU with
/// pending work at the crest and a capacity interruption three quarters in.
fn load_at(i: u32, cycles: u32) -> Reading {
    let phase = f64::from(i) / f64::from(cycles.max(1));
    let cpu = 50.0 + 40.0 * (phase * TAU).sin();
    let mut reading = Reading::cpu(cpu);
    if cpu > 85.0 {
        reading = reading.with_pending(3);
    }
    if i == cycles * 3 / 4 {
        reading = reading.with_interruption();
    }
    reading
}

pub async fn run(mut config: FleetConfig, cycles: u32, hang_drains: bool) -> anyhow::Result<()> {
    config.lifecycle.call_timeout = HumanDuration::from_secs(1);
    config.lifecycle.poll_interval = HumanDuration::from_millis(2);
    config.lifecycle.ready_timeout = HumanDuration::from_millis(100);
    config.lifecycle.drain_grace = HumanDuration::from_millis(20);
    config.lifecycle.terminate_timeout = HumanDuration::from_millis(100);
    config.validate()?;

    let cluster_id = config.cluster.cluster_id.clone();
    let step = config.metrics.interval.as_secs().max(1);
    let clock = Arc::new(ManualClock::new(epoch_secs()));
    let sim = Arc::new(SimulatedCluster::new(clock.clone()));
    sim.seed_ready(&cluster_id, &config.cluster.zones, config.cluster.min_nodes)
        .await;
    sim.set_boot_polls(2).await;
    if hang_drains {
        sim.set_drain_behavior(DrainBehavior::Hang).await;
    }
    let source = Arc::new(ScriptedSource::new());

    let control = ControlLoop::new(
        config,
        Arc::new(StateStore::open_in_memory()?),
        source.clone(),
        sim.clone(),
        sim.clone(),
        clock.clone(),
        "simulate",
    )
    .with_callback(Arc::new(|event: CycleEvent| -> BoxFuture {
        Box::pin(async move {
            match serde_json::to_string(&event) {
                Ok(json) => println!("{json}"),
                Err(e) => debug!(error = %e, "failed to encode cycle event"),
            }
        })
    }));

    info!(%cluster_id, cycles, step_secs = step, "simulation starting");
    for i in 0..cycles {
        source.set(load_at(i, cycles)).await;
        // Errors are already reported through the event stream.
        let _ = control.run_cycle().await;
        clock.advance(step);
    }

    let state = control.locks().read_state(&cluster_id)?;
    info!(
        %cluster_id,
        node_count = state.node_count,
        ready = sim.ready_count().await,
        created = sim.create_calls().await,
        "simulation finished"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_curve_crests_with_pending_work() {
        let crest = load_at(12, 48);
        assert!(crest.cpu > 85.0);
        assert_eq!(crest.pending, 3);

        let trough = load_at(36, 48);
        assert!(trough.cpu < 15.0);
        assert!(trough.interruption);
        assert_eq!(trough.pending, 0);
    }
}
