//! Stories about bootstrapping the control-plane node

use std::os::unix::fs::PermissionsExt;

use kubestrap::config::NodeRole;
use kubestrap::credentials::AddressMode;
use kubestrap::exec::CommandOutput;
use kubestrap::pipeline::{steps, NodeBootstrap, StepOutcome};
use kubestrap::Error;

use super::helpers::{collaborators, config, on_host, ScriptedHost, StaticManifests, StaticMetadata};

const CP_IP: &str = "10.0.1.10";
const CP_HOSTNAME: &str = "IP-10-0-1-10.ec2.internal";

fn metadata() -> std::sync::Arc<StaticMetadata> {
    StaticMetadata::new(CP_IP, CP_HOSTNAME)
}

// =============================================================================
// Story: A bare VM becomes a control plane with operator access
// =============================================================================

#[tokio::test]
async fn story_control_plane_runs_every_step_in_order() {
    let root = tempfile::tempdir().unwrap();
    let host = ScriptedHost::new();
    let cfg = config(root.path(), NodeRole::ControlPlane);

    let deps = collaborators(&host, metadata(), StaticManifests::default());
    let report = NodeBootstrap::new(cfg, deps).run().await.unwrap();

    assert!(report.succeeded());
    assert_eq!(
        report.step_names(),
        vec![
            steps::RESOLVE_IDENTITY,
            steps::INSTALL_RUNTIME,
            steps::INSTALL_TOOLING,
            steps::INITIALIZE_CONTROL_PLANE,
            steps::PROVISION_ACCESS,
            steps::INSTALL_ADDONS,
        ]
    );
    let identity = report.identity.as_ref().unwrap();
    assert_eq!(identity.hostname, "ip-10-0-1-10.ec2.internal");
    assert_eq!(identity.local_ip.to_string(), CP_IP);

    // kubeadm never runs init on a host it has not reset first
    let kubeadm: Vec<String> = host
        .commands()
        .into_iter()
        .filter(|c| c.starts_with("kubeadm reset") || c.starts_with("kubeadm init"))
        .collect();
    assert_eq!(kubeadm.len(), 2);
    assert!(kubeadm[0].starts_with("kubeadm reset -f"));
    assert!(kubeadm[1].starts_with("kubeadm init --config"));

    // The overlay goes on before any operator credential is minted
    let commands = host.commands();
    let overlay = commands
        .iter()
        .position(|c| c.contains("apply -f https://"))
        .unwrap();
    let binding = commands
        .iter()
        .position(|c| c.contains("create clusterrolebinding"))
        .unwrap();
    assert!(overlay < binding);
}

#[tokio::test]
async fn story_mixed_case_dns_name_is_lowercased_everywhere() {
    let root = tempfile::tempdir().unwrap();
    let host = ScriptedHost::new();
    let cfg = config(root.path(), NodeRole::ControlPlane);

    let deps = collaborators(&host, metadata(), StaticManifests::default());
    let report = NodeBootstrap::new(cfg, deps).run().await.unwrap();

    let init = host.config_files("kubeadm init");
    assert_eq!(init.len(), 1);
    assert!(init[0].contains("api.example.com"));
    assert!(!init[0].contains("API.Example.COM"));
    for san in ["203.0.113.10", CP_IP, "ip-10-0-1-10.ec2.internal"] {
        assert!(init[0].contains(san), "certSANs missing {}", san);
    }

    let dns = report
        .kubeconfigs
        .iter()
        .find(|k| k.address_mode == AddressMode::Dns)
        .unwrap();
    assert_eq!(dns.server, "https://api.example.com:6443");
    let written: serde_yaml::Value =
        serde_yaml::from_str(&std::fs::read_to_string(on_host(root.path(), &dns.path)).unwrap())
            .unwrap();
    assert_eq!(
        written["clusters"][0]["cluster"]["server"].as_str(),
        Some("https://api.example.com:6443")
    );
}

// =============================================================================
// Story: Both kubeconfigs carry the same credentials
// =============================================================================

#[tokio::test]
async fn story_kubeconfig_variants_differ_only_in_server() {
    let root = tempfile::tempdir().unwrap();
    let host = ScriptedHost::new();
    let cfg = config(root.path(), NodeRole::ControlPlane);

    let deps = collaborators(&host, metadata(), StaticManifests::default());
    let report = NodeBootstrap::new(cfg, deps).run().await.unwrap();
    assert_eq!(report.kubeconfigs.len(), 2);

    let mut docs = Vec::new();
    for artifact in &report.kubeconfigs {
        let path = on_host(root.path(), &artifact.path);
        let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600, "{} is not private", artifact.path.display());
        assert_eq!(artifact.owner, "ubuntu");

        let mut doc: serde_yaml::Value =
            serde_yaml::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        let server = doc["clusters"][0]["cluster"]["server"].clone();
        assert_eq!(server.as_str().unwrap(), artifact.server);
        doc["clusters"][0]["cluster"]["server"] = serde_yaml::Value::Null;
        docs.push(doc);
    }
    assert_eq!(docs[0], docs[1]);

    let ip = report
        .kubeconfigs
        .iter()
        .find(|k| k.address_mode == AddressMode::Ip)
        .unwrap();
    assert_eq!(ip.server, "https://203.0.113.10:6443");

    // Ownership goes to the operational user
    assert_eq!(host.count("chown ubuntu:ubuntu"), 2);
}

// =============================================================================
// Story: Rerunning on a dirty host converges to the same result
// =============================================================================

#[tokio::test]
async fn story_rerun_on_same_host_produces_identical_artifacts() {
    let root = tempfile::tempdir().unwrap();
    let host = ScriptedHost::new();

    let first = NodeBootstrap::new(
        config(root.path(), NodeRole::ControlPlane),
        collaborators(&host, metadata(), StaticManifests::default()),
    )
    .run()
    .await
    .unwrap();
    let snapshot: Vec<String> = first
        .kubeconfigs
        .iter()
        .map(|k| std::fs::read_to_string(on_host(root.path(), &k.path)).unwrap())
        .collect();

    let second = NodeBootstrap::new(
        config(root.path(), NodeRole::ControlPlane),
        collaborators(&host, metadata(), StaticManifests::default()),
    )
    .run()
    .await
    .unwrap();

    assert!(second.succeeded());
    assert_eq!(first.step_names(), second.step_names());
    assert_eq!(first.kubeconfigs, second.kubeconfigs);
    for (artifact, before) in second.kubeconfigs.iter().zip(&snapshot) {
        let after = std::fs::read_to_string(on_host(root.path(), &artifact.path)).unwrap();
        assert_eq!(&after, before);
    }

    // Each run reset before it initialized
    assert_eq!(host.count("kubeadm reset"), 2);
    assert_eq!(host.count("kubeadm init"), 2);
    let init = host.config_files("kubeadm init");
    assert_eq!(init[0], init[1]);
}

// =============================================================================
// Story: Failures stop the run and say where
// =============================================================================

#[tokio::test]
async fn story_init_failure_stops_before_credentials() {
    let root = tempfile::tempdir().unwrap();
    let host = ScriptedHost::new();
    host.respond(
        "kubeadm init",
        CommandOutput::failed(1, "[ERROR Port-6443]: Port 6443 is in use"),
    );

    let failure = NodeBootstrap::new(
        config(root.path(), NodeRole::ControlPlane),
        collaborators(&host, metadata(), StaticManifests::default()),
    )
    .run()
    .await
    .unwrap_err();

    assert_eq!(failure.step, steps::INITIALIZE_CONTROL_PLANE);
    assert!(matches!(failure.source, Error::InitFailure(ref m) if m.contains("Port 6443")));
    assert_eq!(
        failure.report.step_names().last(),
        Some(&steps::INITIALIZE_CONTROL_PLANE)
    );
    assert!(failure.report.kubeconfigs.is_empty());
    assert_eq!(host.count("kubectl"), 0);
}

#[tokio::test]
async fn story_runtime_failure_names_the_substep() {
    let root = tempfile::tempdir().unwrap();
    let host = ScriptedHost::new();
    host.respond(
        "modprobe br_netfilter",
        CommandOutput::failed(1, "modprobe: FATAL: Module br_netfilter not found"),
    );

    let failure = NodeBootstrap::new(
        config(root.path(), NodeRole::ControlPlane),
        collaborators(&host, metadata(), StaticManifests::default()),
    )
    .run()
    .await
    .unwrap_err();

    assert_eq!(failure.step, steps::INSTALL_RUNTIME);
    let failed = failure.report.failed_step().unwrap();
    assert!(matches!(&failed.outcome, StepOutcome::Failed(m) if m.contains("br_netfilter")));
    assert_eq!(host.count("kubeadm"), 0);
}

// =============================================================================
// Story: Addons are best effort unless told otherwise
// =============================================================================

const GOOD_ADDON: &str = "https://addons.example.com/autoscaler.yaml";
const MISSING_ADDON: &str = "https://addons.example.com/missing.yaml";

fn addon_config(root: &std::path::Path, fatal: bool) -> kubestrap::config::BootstrapConfig {
    let mut source = super::helpers::source(root);
    source.addons = Some(vec![GOOD_ADDON.to_string(), MISSING_ADDON.to_string()]);
    source.addons_fatal = Some(fatal);
    source.build(NodeRole::ControlPlane).unwrap()
}

#[tokio::test]
async fn story_failed_addon_leaves_cluster_usable() {
    let root = tempfile::tempdir().unwrap();
    let host = ScriptedHost::new();
    let manifests = StaticManifests::default().with(GOOD_ADDON, "name: $CLUSTER_NAME\n");

    let report = NodeBootstrap::new(
        addon_config(root.path(), false),
        collaborators(&host, metadata(), manifests),
    )
    .run()
    .await
    .unwrap();

    assert!(report.succeeded());
    let addons = report.steps.last().unwrap();
    assert_eq!(addons.name, steps::INSTALL_ADDONS);
    assert!(matches!(&addons.outcome, StepOutcome::Partial(m) if m.contains(MISSING_ADDON)));
    assert_eq!(report.addons.len(), 2);
    assert!(report.addons[0].succeeded());
    assert!(!report.addons[1].succeeded());
    assert_eq!(report.kubeconfigs.len(), 2);
}

#[tokio::test]
async fn story_fatal_addons_fail_the_run() {
    let root = tempfile::tempdir().unwrap();
    let host = ScriptedHost::new();
    let manifests = StaticManifests::default().with(GOOD_ADDON, "name: $CLUSTER_NAME\n");

    let failure = NodeBootstrap::new(
        addon_config(root.path(), true),
        collaborators(&host, metadata(), manifests),
    )
    .run()
    .await
    .unwrap_err();

    assert_eq!(failure.step, steps::INSTALL_ADDONS);
    assert!(matches!(
        failure.source,
        Error::AddonApplyFailure { ref url, .. } if url == MISSING_ADDON
    ));
    assert_eq!(failure.report.addons.len(), 2);
}
