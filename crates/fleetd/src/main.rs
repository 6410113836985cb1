//! fleetd: the nodefleet daemon.
//!
//! Wires a metric source, the coordination store, the compute provider and
//! the cluster control plane into a [`ControlLoop`] and ticks it.
//!
//! # Usage
//!
//! ```text
//! fleetd run --config /etc/nodefleet/fleet.toml --data-dir /var/lib/nodefleet
//! fleetd once --config fleet.toml
//! fleetd simulate --cycles 40 --hang-drains
//! fleetd check-config --config fleet.toml
//! ```

mod simulate;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use nodefleet_control::{BoxFuture, ControlLoop, CycleEvent, EventCallback};
use nodefleet_core::{FleetConfig, HumanDuration, SystemClock, parse_duration};
use nodefleet_lifecycle::{HttpComputeApi, KubectlControlPlane};
use nodefleet_metrics::PrometheusSource;
use nodefleet_state::StateStore;
use tokio::sync::watch;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "fleetd", about = "nodefleet autoscaling daemon")]
struct Cli {
    /// Log output format.
    #[arg(long, value_enum, default_value = "text", global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Run the control loop until interrupted.
    Run {
        #[arg(long, default_value = "/etc/nodefleet/fleet.toml")]
        config: PathBuf,

        /// Directory holding the coordination store.
        #[arg(long, default_value = "/var/lib/nodefleet")]
        data_dir: PathBuf,

        /// Tick interval, overriding `[metrics] interval` (e.g. "60s").
        #[arg(long)]
        interval: Option<String>,
    },

    /// Run a single cycle and print its report as JSON.
    Once {
        #[arg(long, default_value = "/etc/nodefleet/fleet.toml")]
        config: PathBuf,

        #[arg(long, default_value = "/var/lib/nodefleet")]
        data_dir: PathBuf,
    },

    /// Drive the control loop against an in-memory cluster and a synthetic
    /// load curve.
    Simulate {
        /// Optional config; defaults are used otherwise.
        #[arg(long)]
        config: Option<PathBuf>,

        #[arg(long, default_value = "48")]
        cycles: u32,

        /// Make every drain hang so removals are forced.
        #[arg(long)]
        hang_drains: bool,
    },

    /// Validate a config file and print the effective configuration.
    CheckConfig {
        #[arg(long, default_value = "/etc/nodefleet/fleet.toml")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match cli.command {
        Command::Run {
            config,
            data_dir,
            interval,
        } => run(&config, &data_dir, interval.as_deref()).await,
        Command::Once { config, data_dir } => once(&config, &data_dir).await,
        Command::Simulate {
            config,
            cycles,
            hang_drains,
        } => {
            let config = match config {
                Some(path) => load_config(&path)?,
                None => FleetConfig::default(),
            };
            simulate::run(config, cycles, hang_drains).await
        }
        Command::CheckConfig { config } => {
            let config = load_config(&config)?;
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
    }
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,fleetd=debug,nodefleet=debug"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn load_config(path: &Path) -> anyhow::Result<FleetConfig> {
    FleetConfig::from_file(path).with_context(|| format!("loading {}", path.display()))
}

/// Identifies this process in lock records.
fn holder_prefix() -> String {
    let host = std::env::var("HOSTNAME")
        .ok()
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok())
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "fleetd".to_string());
    format!("{host}:{}", std::process::id())
}

/// Logs each cycle event as one JSON line.
fn log_events() -> EventCallback {
    Arc::new(|event: CycleEvent| -> BoxFuture {
        Box::pin(async move {
            match serde_json::to_string(&event) {
                Ok(json) => info!(target: "fleetd::events", cluster_id = %event.cluster_id, event = %json, "cycle event"),
                Err(e) => warn!(error = %e, "failed to encode cycle event"),
            }
        })
    })
}

fn build_loop(config: FleetConfig, data_dir: &Path) -> anyhow::Result<ControlLoop> {
    std::fs::create_dir_all(data_dir)?;
    let db_path = data_dir.join("nodefleet.redb");
    let store = Arc::new(StateStore::open(&db_path)?);
    info!(path = ?db_path, "coordination store opened");

    let metrics = PrometheusSource::from_config(&config.metrics)?;
    let compute_url = config
        .lifecycle
        .compute_api_url
        .clone()
        .context("[lifecycle] compute_api_url is required")?;
    let compute = HttpComputeApi::new(compute_url, config.lifecycle.call_timeout.as_duration());
    let control = KubectlControlPlane::new(
        config.lifecycle.kubectl_path.clone(),
        config.lifecycle.kubeconfig.clone(),
    );

    Ok(ControlLoop::new(
        config,
        store,
        Arc::new(metrics),
        Arc::new(compute),
        Arc::new(control),
        Arc::new(SystemClock),
        holder_prefix(),
    )
    .with_callback(log_events()))
}

/// Fold a `--interval` override into the config so the history window and
/// the tick agree.
fn apply_interval(config: &mut FleetConfig, interval: Option<&str>) -> anyhow::Result<Duration> {
    if let Some(s) = interval {
        let parsed = parse_duration(s).with_context(|| format!("invalid --interval {s:?}"))?;
        config.metrics.interval = HumanDuration::from(parsed);
        config.validate()?;
    }
    Ok(config.metrics.interval.as_duration())
}

async fn run(config_path: &Path, data_dir: &Path, interval: Option<&str>) -> anyhow::Result<()> {
    let mut config = load_config(config_path)?;
    let interval = apply_interval(&mut config, interval)?;
    info!(cluster_id = %config.cluster.cluster_id, "fleetd starting");

    let control = Arc::new(build_loop(config, data_dir)?);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(control.run(interval, shutdown_rx));

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);
    handle.await?;

    info!("fleetd stopped");
    Ok(())
}

async fn once(config_path: &Path, data_dir: &Path) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let control = build_loop(config, data_dir)?;
    let report = control.run_cycle().await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_override_reaches_config() {
        let mut config = FleetConfig::default();
        let tick = apply_interval(&mut config, Some("45s")).unwrap();
        assert_eq!(tick, Duration::from_secs(45));
        assert_eq!(config.metrics.interval.as_secs(), 45);

        let mut config = FleetConfig::default();
        assert_eq!(apply_interval(&mut config, None).unwrap(), Duration::from_secs(120));
        assert!(apply_interval(&mut config, Some("soon")).is_err());
    }
}
