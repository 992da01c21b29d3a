//! Control-plane initialization
//!
//! Renders and validates the init manifest, resets the host, runs
//! `kubeadm init`, applies the pod network overlay and then blocks until the
//! control-plane node reports Ready. Nodes only turn Ready once the overlay
//! is running, so returning from here means the cluster can schedule pods
//! and addon installation may start.

use tracing::info;

use crate::config::BootstrapConfig;
use crate::exec::CommandRunner;
use crate::host::HostFs;
use crate::identity::NodeIdentity;
use crate::kubeadm::{Kubeadm, ADMIN_KUBECONFIG};
use crate::kubectl::Kubectl;
use crate::manifest::{self, InitManifest};
use crate::probe::{self, ClusterProbe, NodeCounts};
use crate::state::Transition;
use crate::{Error, Result};

/// Taint kubeadm puts on control-plane nodes
pub const CONTROL_PLANE_TAINT: &str = "node-role.kubernetes.io/control-plane:NoSchedule";

/// What a successful initialization produced
#[derive(Debug)]
pub struct InitOutcome {
    /// The manifest `kubeadm init` ran with
    pub manifest: InitManifest,
    /// Node counts observed when the control plane turned Ready
    pub nodes: NodeCounts,
    /// kubeadm transitions applied during the run
    pub transitions: Vec<Transition>,
}

/// Brings up the control plane on this node
pub struct ControlPlaneInitializer<'a, R: CommandRunner + ?Sized> {
    runner: &'a R,
    fs: &'a HostFs,
    probe: &'a dyn ClusterProbe,
    cfg: &'a BootstrapConfig,
}

impl<'a, R: CommandRunner + ?Sized> ControlPlaneInitializer<'a, R> {
    /// Create an initializer
    pub fn new(
        runner: &'a R,
        fs: &'a HostFs,
        probe: &'a dyn ClusterProbe,
        cfg: &'a BootstrapConfig,
    ) -> Self {
        Self {
            runner,
            fs,
            probe,
            cfg,
        }
    }

    /// Initialize the cluster and wait for the control plane to be Ready
    pub async fn initialize(&self, identity: &NodeIdentity) -> Result<InitOutcome> {
        let manifest = InitManifest::render(self.cfg, identity)?;
        let yaml = manifest.to_yaml()?;
        let config_file = manifest::write_temp("kubeadm-init-", &yaml)?;

        info!(
            node = %identity.hostname,
            token_id = self.cfg.cluster.bootstrap_token.id(),
            endpoint = %self.cfg.cluster.control_plane_endpoint(),
            "Initializing control plane"
        );

        let mut kubeadm = Kubeadm::new(self.runner, self.cfg.runtime.cri_endpoint());
        kubeadm.reset().await?;
        kubeadm
            .init(config_file.path(), self.cfg.init.init_timeout)
            .await?;
        drop(config_file);

        let admin = self.fs.resolve(ADMIN_KUBECONFIG);
        let kubectl = Kubectl::new(self.runner, admin.display().to_string());

        info!(url = %self.cfg.init.overlay_manifest_url, "Applying pod network overlay");
        kubectl
            .apply_source(&self.cfg.init.overlay_manifest_url)
            .await
            .map_err(|e| Error::InitFailure(format!("pod network overlay: {}", e)))?;

        if self.cfg.init.untaint_control_plane {
            kubectl
                .remove_taint_all(CONTROL_PLANE_TAINT)
                .await
                .map_err(|e| Error::InitFailure(format!("untaint control plane: {}", e)))?;
        }

        let nodes =
            probe::wait_for_control_plane_ready(self.probe, self.cfg.init.ready_timeout).await?;

        Ok(InitOutcome {
            manifest,
            nodes,
            transitions: kubeadm.history().to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{fixtures, ConfigSource, NodeRole};
    use crate::exec::fake::FakeRunner;
    use crate::probe::MockClusterProbe;

    fn identity() -> NodeIdentity {
        NodeIdentity::new("10.0.1.10".parse().unwrap(), "ip-10-0-1-10")
    }

    fn ready_probe() -> MockClusterProbe {
        let mut probe = MockClusterProbe::new();
        probe.expect_node_counts().returning(|| {
            Ok(NodeCounts {
                control_plane_ready: 1,
                control_plane_total: 1,
                ..Default::default()
            })
        });
        probe
    }

    // ==========================================================================
    // Story: Control plane comes up in a fixed order
    // ==========================================================================

    #[tokio::test]
    async fn story_reset_init_overlay_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let fs = HostFs::new(dir.path());
        let runner = FakeRunner::new();
        let probe = ready_probe();
        let cfg = fixtures::control_plane();

        let outcome = ControlPlaneInitializer::new(&runner, &fs, &probe, &cfg)
            .initialize(&identity())
            .await
            .unwrap();

        let calls = runner.calls();
        assert!(calls[0].starts_with("kubeadm reset -f"));
        assert!(calls[1].starts_with("kubeadm init --config "));
        assert!(calls[1].ends_with("--upload-certs"));
        assert!(calls[2].contains("apply -f https://raw.githubusercontent.com/projectcalico"));
        assert_eq!(calls.len(), 3, "no untaint by default: {:?}", calls);
        assert_eq!(
            outcome.transitions,
            vec![Transition::Reset, Transition::Initialize]
        );
        assert_eq!(outcome.nodes.control_plane_ready, 1);
    }

    #[tokio::test]
    async fn story_init_manifest_is_removed_after_kubeadm_reads_it() {
        let dir = tempfile::tempdir().unwrap();
        let fs = HostFs::new(dir.path());
        let runner = FakeRunner::new();
        let probe = ready_probe();
        let cfg = fixtures::control_plane();

        ControlPlaneInitializer::new(&runner, &fs, &probe, &cfg)
            .initialize(&identity())
            .await
            .unwrap();

        let init = runner
            .invocations()
            .into_iter()
            .find(|i| i.args.first().map(String::as_str) == Some("init"))
            .unwrap();
        assert!(!std::path::Path::new(&init.args[2]).exists());
    }

    #[tokio::test]
    async fn story_init_failure_stops_before_overlay() {
        let dir = tempfile::tempdir().unwrap();
        let fs = HostFs::new(dir.path());
        let runner = FakeRunner::new().fail(
            "kubeadm init",
            1,
            "[ERROR CRI]: container runtime is not running",
        );
        let mut probe = MockClusterProbe::new();
        probe.expect_node_counts().never();
        let cfg = fixtures::control_plane();

        let err = ControlPlaneInitializer::new(&runner, &fs, &probe, &cfg)
            .initialize(&identity())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InitFailure(ref m) if m.contains("container runtime")));
        assert_eq!(runner.count("kubectl"), 0);
    }

    #[tokio::test]
    async fn story_invalid_manifest_never_touches_host() {
        let dir = tempfile::tempdir().unwrap();
        let fs = HostFs::new(dir.path());
        let runner = FakeRunner::new();
        let probe = MockClusterProbe::new();
        let cfg = fixtures::control_plane();
        let bad = NodeIdentity {
            local_ip: "10.0.1.10".parse().unwrap(),
            hostname: "Mixed-Case".to_string(),
        };

        let err = ControlPlaneInitializer::new(&runner, &fs, &probe, &cfg)
            .initialize(&bad)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Configuration { .. }));
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn untaint_runs_after_overlay_when_enabled() {
        let dir = tempfile::tempdir().unwrap();
        let fs = HostFs::new(dir.path());
        let runner = FakeRunner::new();
        let probe = ready_probe();
        let cfg = ConfigSource {
            untaint_control_plane: Some(true),
            ..fixtures::source()
        }
        .build(NodeRole::ControlPlane)
        .unwrap();

        ControlPlaneInitializer::new(&runner, &fs, &probe, &cfg)
            .initialize(&identity())
            .await
            .unwrap();
        let last = runner.calls().pop().unwrap();
        assert!(last.ends_with(&format!("taint nodes --all {}-", CONTROL_PLANE_TAINT)));
    }

    #[tokio::test]
    async fn overlay_failure_is_init_failure() {
        let dir = tempfile::tempdir().unwrap();
        let fs = HostFs::new(dir.path());
        let runner = FakeRunner::new().fail("kubectl", 1, "unable to fetch manifest");
        let probe = MockClusterProbe::new();
        let cfg = fixtures::control_plane();

        let err = ControlPlaneInitializer::new(&runner, &fs, &probe, &cfg)
            .initialize(&identity())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("pod network overlay"));
    }
}
