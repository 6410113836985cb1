//! KubectlControlPlane: cordon and drain through the `kubectl` binary.

use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::api::{BoxFuture, ControlPlane, DrainStatus};
use crate::error::{LifecycleError, LifecycleResult};

/// Extra time given to kubectl beyond its own `--timeout` before the
/// process is killed.
const DRAIN_SLACK: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct KubectlControlPlane {
    binary: String,
    kubeconfig: Option<String>,
}

enum Exit {
    Success,
    Failed(String),
}

impl KubectlControlPlane {
    pub fn new(binary: impl Into<String>, kubeconfig: Option<String>) -> Self {
        Self {
            binary: binary.into(),
            kubeconfig,
        }
    }

    fn command(&self, args: &[String]) -> Command {
        let mut cmd = Command::new(&self.binary);
        if let Some(path) = &self.kubeconfig {
            cmd.arg("--kubeconfig").arg(path);
        }
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    fn describe(&self, args: &[String]) -> String {
        format!("{} {}", self.binary, args.join(" "))
    }

    async fn run(&self, args: &[String]) -> LifecycleResult<Exit> {
        debug!(command = %self.describe(args), "running kubectl");
        let output = self
            .command(args)
            .output()
            .await
            .map_err(|e| LifecycleError::Command {
                command: self.describe(args),
                reason: e.to_string(),
            })?;
        if output.status.success() {
            Ok(Exit::Success)
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            Ok(Exit::Failed(format!("{}: {stderr}", output.status)))
        }
    }
}

fn cordon_args(node_id: &str) -> Vec<String> {
    vec!["cordon".to_string(), node_id.to_string()]
}

fn drain_args(node_id: &str, grace: Duration) -> Vec<String> {
    vec![
        "drain".to_string(),
        node_id.to_string(),
        "--ignore-daemonsets".to_string(),
        "--delete-emptydir-data".to_string(),
        "--force".to_string(),
        format!("--timeout={}s", grace.as_secs().max(1)),
    ]
}

impl ControlPlane for KubectlControlPlane {
    fn cordon<'a>(&'a self, node_id: &'a str) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let args = cordon_args(node_id);
            match self.run(&args).await? {
                Exit::Success => Ok(()),
                Exit::Failed(reason) => Err(LifecycleError::Command {
                    command: self.describe(&args),
                    reason,
                }),
            }
        })
    }

    fn drain<'a>(&'a self, node_id: &'a str, grace: Duration) -> BoxFuture<'a, DrainStatus> {
        Box::pin(async move {
            let args = drain_args(node_id, grace);
            match timeout(grace + DRAIN_SLACK, self.run(&args)).await {
                Err(_) => {
                    warn!(%node_id, "kubectl drain did not exit; killed");
                    Ok(DrainStatus::TimedOut)
                }
                Ok(Err(e)) => Err(e),
                Ok(Ok(Exit::Success)) => Ok(DrainStatus::Completed),
                Ok(Ok(Exit::Failed(reason))) if reason.contains("timed out") => {
                    Ok(DrainStatus::TimedOut)
                }
                Ok(Ok(Exit::Failed(reason))) => Err(LifecycleError::Command {
                    command: self.describe(&args),
                    reason,
                }),
            }
        })
    }
}
