//! Cluster readiness probing through the Kubernetes API
//!
//! Used after `kubeadm init` to block until the control-plane node reports
//! Ready (which only happens once the pod network overlay is running), and
//! by the `status` subcommand to summarize the cluster.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node;
use kube::api::ListParams;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Api, Client, Config};
#[cfg(test)]
use mockall::automock;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::{Error, Result};

/// Label carried by control-plane nodes
pub const CONTROL_PLANE_LABEL: &str = "node-role.kubernetes.io/control-plane";

const CONDITION_READY: &str = "Ready";
const STATUS_TRUE: &str = "True";
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Ready/total node counts by role
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeCounts {
    /// Control-plane nodes reporting Ready
    pub control_plane_ready: usize,
    /// All control-plane nodes
    pub control_plane_total: usize,
    /// Worker nodes reporting Ready
    pub workers_ready: usize,
    /// All worker nodes
    pub workers_total: usize,
}

fn is_ready(node: &Node) -> bool {
    node.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|conds| {
            conds
                .iter()
                .any(|c| c.type_ == CONDITION_READY && c.status == STATUS_TRUE)
        })
        .unwrap_or(false)
}

fn is_control_plane(node: &Node) -> bool {
    node.metadata
        .labels
        .as_ref()
        .map(|labels| labels.contains_key(CONTROL_PLANE_LABEL))
        .unwrap_or(false)
}

/// Tally nodes by role and readiness
pub fn count_nodes(nodes: &[Node]) -> NodeCounts {
    let mut counts = NodeCounts::default();
    for node in nodes {
        let ready = is_ready(node);
        if is_control_plane(node) {
            counts.control_plane_total += 1;
            counts.control_plane_ready += usize::from(ready);
        } else {
            counts.workers_total += 1;
            counts.workers_ready += usize::from(ready);
        }
    }
    counts
}

/// Trait for querying cluster node state (allows mocking in tests)
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterProbe: Send + Sync {
    /// Count nodes by role and readiness
    async fn node_counts(&self) -> Result<NodeCounts>;
}

/// [`ClusterProbe`] backed by a kube client built from a kubeconfig file
///
/// The client is built on every call: the kubeconfig only appears once
/// `kubeadm init` has written it, which is after the probe is constructed.
pub struct KubeProbe {
    kubeconfig: PathBuf,
}

impl KubeProbe {
    /// Probe the cluster described by the kubeconfig at `path`
    pub fn new(kubeconfig: impl Into<PathBuf>) -> Self {
        Self {
            kubeconfig: kubeconfig.into(),
        }
    }

    /// Kubeconfig path
    pub fn kubeconfig(&self) -> &Path {
        &self.kubeconfig
    }

    async fn client(&self) -> Result<Client> {
        let kubeconfig = Kubeconfig::read_from(&self.kubeconfig).map_err(|e| {
            Error::configuration(
                "kubeconfig",
                format!("failed to read {}: {}", self.kubeconfig.display(), e),
            )
        })?;
        let mut config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .map_err(|e| {
                Error::configuration("kubeconfig", format!("failed to load kubeconfig: {}", e))
            })?;
        config.connect_timeout = Some(CONNECT_TIMEOUT);
        config.read_timeout = Some(READ_TIMEOUT);
        Ok(Client::try_from(config)?)
    }
}

#[async_trait]
impl ClusterProbe for KubeProbe {
    async fn node_counts(&self) -> Result<NodeCounts> {
        let nodes: Api<Node> = Api::all(self.client().await?);
        let list = nodes.list(&ListParams::default()).await?;
        Ok(count_nodes(&list.items))
    }
}

/// Block until at least one control-plane node is Ready
///
/// Probe errors are expected while the API server is still coming up and
/// are retried. Running out of time is [`Error::InitTimeout`].
pub async fn wait_for_control_plane_ready(
    probe: &dyn ClusterProbe,
    timeout: Duration,
) -> Result<NodeCounts> {
    wait_for_control_plane_ready_with_interval(probe, timeout, DEFAULT_POLL_INTERVAL).await
}

async fn wait_for_control_plane_ready_with_interval(
    probe: &dyn ClusterProbe,
    timeout: Duration,
    interval: Duration,
) -> Result<NodeCounts> {
    let start = Instant::now();
    loop {
        match probe.node_counts().await {
            Ok(counts) if counts.control_plane_ready > 0 => {
                info!(
                    control_plane_ready = counts.control_plane_ready,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Control plane node is Ready"
                );
                return Ok(counts);
            }
            Ok(counts) => {
                debug!(?counts, "Control plane not Ready yet");
            }
            Err(e) => {
                debug!(error = %e, "Cluster probe failed, retrying");
            }
        }

        if start.elapsed() >= timeout {
            return Err(Error::InitTimeout(timeout));
        }
        tokio::time::sleep(interval.min(timeout.saturating_sub(start.elapsed()))).await;
    }
}
