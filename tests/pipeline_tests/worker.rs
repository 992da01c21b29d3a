//! Stories about workers joining a control plane that may not be up yet

use std::path::Path;

use kubestrap::config::{BootstrapConfig, NodeRole};
use kubestrap::exec::CommandOutput;
use kubestrap::pipeline::{steps, NodeBootstrap};
use kubestrap::Error;

use super::helpers::{collaborators, source, ScriptedHost, StaticManifests, StaticMetadata};

const REFUSED: &str = "error execution phase preflight: couldn't validate the identity of the API Server: Get \"https://10.0.1.10:6443/api/v1/namespaces/kube-public/configmaps/cluster-info\": dial tcp 10.0.1.10:6443: connect: connection refused";

fn worker(root: &Path, discovery_secs: u64) -> BootstrapConfig {
    let mut source = source(root);
    source.discovery_timeout_secs = Some(discovery_secs);
    source.build(NodeRole::Worker).unwrap()
}

fn metadata() -> std::sync::Arc<StaticMetadata> {
    StaticMetadata::new("10.0.1.21", "ip-10-0-1-21.ec2.internal")
}

/// kubeadm subcommands in call order, e.g. `["reset", "join", ...]`
fn kubeadm_sequence(host: &ScriptedHost) -> Vec<String> {
    host.commands()
        .iter()
        .filter_map(|c| c.strip_prefix("kubeadm "))
        .filter_map(|c| c.split_whitespace().next())
        .map(str::to_string)
        .collect()
}

// =============================================================================
// Story: A worker waits for the control plane and then joins
// =============================================================================

#[tokio::test(start_paused = true)]
async fn story_worker_joins_once_control_plane_comes_up() {
    let root = tempfile::tempdir().unwrap();
    let host = ScriptedHost::new();
    host.respond_with("kubeadm join", |n| {
        if n < 2 {
            CommandOutput::failed(1, REFUSED)
        } else {
            CommandOutput::ok("This node has joined the cluster")
        }
    });

    let report = NodeBootstrap::new(
        worker(root.path(), 300),
        collaborators(&host, metadata(), StaticManifests::default()),
    )
    .run()
    .await
    .unwrap();

    assert!(report.succeeded());
    assert_eq!(
        report.step_names(),
        vec![
            steps::RESOLVE_IDENTITY,
            steps::INSTALL_RUNTIME,
            steps::INSTALL_TOOLING,
            steps::JOIN_CLUSTER,
        ]
    );
    assert_eq!(
        kubeadm_sequence(&host),
        vec!["reset", "join", "reset", "join", "reset", "join"]
    );

    // Workers never touch the cluster's control-plane tooling
    assert_eq!(host.count("kubeadm init"), 0);
    assert_eq!(host.count("kubectl"), 0);
    assert!(report.kubeconfigs.is_empty());
}

#[tokio::test(start_paused = true)]
async fn story_join_manifest_carries_node_identity_and_endpoint() {
    let root = tempfile::tempdir().unwrap();
    let host = ScriptedHost::new();

    NodeBootstrap::new(
        worker(root.path(), 300),
        collaborators(&host, metadata(), StaticManifests::default()),
    )
    .run()
    .await
    .unwrap();

    let join = host.config_files("kubeadm join");
    assert_eq!(join.len(), 1);
    assert!(join[0].contains("10.0.1.10:6443"));
    assert!(join[0].contains("name: ip-10-0-1-21.ec2.internal"));
    assert!(join[0].contains("node-ip"));
    assert!(join[0].contains("10.0.1.21"));
}

// =============================================================================
// Story: A worker gives up when the control plane never appears
// =============================================================================

#[tokio::test(start_paused = true)]
async fn story_worker_gives_up_at_discovery_deadline() {
    let root = tempfile::tempdir().unwrap();
    let host = ScriptedHost::new();
    host.respond("kubeadm join", CommandOutput::failed(1, REFUSED));

    let failure = NodeBootstrap::new(
        worker(root.path(), 60),
        collaborators(&host, metadata(), StaticManifests::default()),
    )
    .run()
    .await
    .unwrap_err();

    assert_eq!(failure.step, steps::JOIN_CLUSTER);
    match &failure.source {
        Error::JoinTimeout {
            timeout,
            last_error,
        } => {
            assert_eq!(timeout.as_secs(), 60);
            assert!(last_error.contains("connection refused"));
        }
        other => panic!("expected JoinTimeout, got {:?}", other),
    }
    assert!(failure.source.is_retryable());

    let attempts = host.count("kubeadm join");
    assert!(attempts >= 2, "only {} join attempts", attempts);
    assert_eq!(host.count("kubeadm reset"), attempts);
}

// =============================================================================
// Story: A wrong token is not worth waiting for
// =============================================================================

#[tokio::test(start_paused = true)]
async fn story_wrong_token_is_rejected_without_retrying() {
    let root = tempfile::tempdir().unwrap();
    let host = ScriptedHost::new();
    host.respond(
        "kubeadm join",
        CommandOutput::failed(
            1,
            "couldn't validate the identity of the API Server: could not find a JWS signature in the cluster-info ConfigMap for token ID \"abc123\"",
        ),
    );

    let failure = NodeBootstrap::new(
        worker(root.path(), 300),
        collaborators(&host, metadata(), StaticManifests::default()),
    )
    .run()
    .await
    .unwrap_err();

    assert_eq!(failure.step, steps::JOIN_CLUSTER);
    assert!(matches!(failure.source, Error::JoinRejected(ref m) if m.contains("JWS signature")));
    assert!(!failure.source.is_retryable());
    assert_eq!(host.count("kubeadm join"), 1);
}

#[tokio::test(start_paused = true)]
async fn story_wrong_token_secret_is_rejected_without_retrying() {
    let root = tempfile::tempdir().unwrap();
    let host = ScriptedHost::new();
    host.respond(
        "kubeadm join",
        CommandOutput::failed(
            1,
            "error execution phase preflight: couldn't validate the identity of the API Server: failed to verify JWS signature of received cluster info object, can't trust this API Server",
        ),
    );

    let failure = NodeBootstrap::new(
        worker(root.path(), 300),
        collaborators(&host, metadata(), StaticManifests::default()),
    )
    .run()
    .await
    .unwrap_err();

    assert_eq!(failure.step, steps::JOIN_CLUSTER);
    assert!(matches!(
        failure.source,
        Error::JoinRejected(ref m) if m.contains("failed to verify JWS signature")
    ));
    assert!(!failure.source.is_retryable());
    assert_eq!(host.count("kubeadm join"), 1);
    assert_eq!(kubeadm_sequence(&host), vec!["reset", "join"]);
}
