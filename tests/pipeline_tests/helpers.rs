//! Scripted host shared by the pipeline stories

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use kubestrap::addons::ManifestFetcher;
use kubestrap::config::{BootstrapConfig, ConfigSource, NodeRole};
use kubestrap::exec::{CommandOutput, CommandRunner, Invocation};
use kubestrap::identity::{MetadataClient, LOCAL_HOSTNAME_PATH, LOCAL_IPV4_PATH};
use kubestrap::pipeline::Collaborators;
use kubestrap::probe::{ClusterProbe, NodeCounts};
use kubestrap::{Error, Result};

// =============================================================================
// Fixtures
// =============================================================================

pub const TOKEN: &str = "abc123.0123456789abcdef";

/// What `kubeadm kubeconfig user` prints: CA and client material plus the
/// server address from the ClusterConfiguration
pub const RENDERED_KUBECONFIG: &str = r#"apiVersion: v1
kind: Config
clusters:
- cluster:
    certificate-authority-data: Q0EtREFUQQ==
    server: https://10.0.1.10:6443
  name: demo
contexts:
- context:
    cluster: demo
    user: kubernetes-admin-user
  name: kubernetes-admin-user@demo
current-context: kubernetes-admin-user@demo
users:
- name: kubernetes-admin-user
  user:
    client-certificate-data: Q0xJRU5ULUNFUlQ=
    client-key-data: Q0xJRU5ULUtFWQ==
"#;

/// Configuration as the provisioning layer would hand it over
pub fn source(host_root: &Path) -> ConfigSource {
    ConfigSource {
        bootstrap_token: Some(TOKEN.to_string()),
        control_plane_ip: Some("10.0.1.10".to_string()),
        public_ip: Some("203.0.113.10".to_string()),
        dns_name: Some("API.Example.COM".to_string()),
        cluster_name: Some("demo".to_string()),
        kubernetes_version: Some("1.30.2".to_string()),
        region: Some("eu-west-1".to_string()),
        worker_count: Some(2),
        subnet_ids: Some(vec!["subnet-0a1b".to_string()]),
        addons: Some(Vec::new()),
        unsafe_skip_ca_verification: Some(true),
        host_root: Some(host_root.to_path_buf()),
        ..ConfigSource::default()
    }
}

pub fn config(host_root: &Path, role: NodeRole) -> BootstrapConfig {
    source(host_root).build(role).unwrap()
}

// =============================================================================
// Scripted command runner
// =============================================================================

type Responder = Box<dyn Fn(usize) -> CommandOutput + Send + Sync>;

/// Answers commands by prefix and remembers what it was asked
///
/// The most recently added matching rule wins. Commands with no rule
/// succeed with empty output, except `kubeadm kubeconfig user`, which
/// prints [`RENDERED_KUBECONFIG`]. The contents of any `--config` file are
/// captured at call time, since kubeadm manifests are temporary files.
#[derive(Default)]
pub struct ScriptedHost {
    rules: Mutex<Vec<(String, Responder)>>,
    calls: Mutex<Vec<Invocation>>,
    configs: Mutex<Vec<(String, String)>>,
}

impl ScriptedHost {
    pub fn new() -> Arc<Self> {
        let host = Self::default();
        host.respond("kubeadm kubeconfig user", CommandOutput::ok(RENDERED_KUBECONFIG));
        Arc::new(host)
    }

    pub fn respond(&self, prefix: &str, output: CommandOutput) {
        self.respond_with(prefix, move |_| output.clone());
    }

    /// Answer the n-th (0-based) matching call with `f(n)`
    pub fn respond_with<F>(&self, prefix: &str, f: F)
    where
        F: Fn(usize) -> CommandOutput + Send + Sync + 'static,
    {
        self.rules
            .lock()
            .unwrap()
            .push((prefix.to_string(), Box::new(f)));
    }

    /// Rendered commands, in call order
    pub fn commands(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|c| c.to_string())
            .collect()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.commands()
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    /// Contents of the `--config` files passed to commands starting with `prefix`
    pub fn config_files(&self, prefix: &str) -> Vec<String> {
        self.configs
            .lock()
            .unwrap()
            .iter()
            .filter(|(cmd, _)| cmd.starts_with(prefix))
            .map(|(_, content)| content.clone())
            .collect()
    }
}

#[async_trait]
impl CommandRunner for ScriptedHost {
    async fn run(&self, invocation: &Invocation) -> Result<CommandOutput> {
        let rendered = invocation.to_string();

        if let Some(pos) = invocation.args.iter().position(|a| a == "--config") {
            if let Some(path) = invocation.args.get(pos + 1) {
                if let Ok(content) = std::fs::read_to_string(path) {
                    self.configs
                        .lock()
                        .unwrap()
                        .push((rendered.clone(), content));
                }
            }
        }

        let seen: Vec<String> = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(invocation.clone());
            calls.iter().map(|c| c.to_string()).collect()
        };

        let rules = self.rules.lock().unwrap();
        let output = rules
            .iter()
            .rev()
            .find(|(prefix, _)| rendered.starts_with(prefix.as_str()))
            .map(|(prefix, respond)| {
                let nth = seen.iter().filter(|c| c.starts_with(prefix.as_str())).count();
                respond(nth - 1)
            })
            .unwrap_or_else(|| CommandOutput::ok(""));
        Ok(output)
    }
}

// =============================================================================
// Metadata, manifests and cluster
// =============================================================================

/// Instance metadata for one VM
pub struct StaticMetadata {
    local_ip: String,
    hostname: String,
}

impl StaticMetadata {
    pub fn new(local_ip: &str, hostname: &str) -> Arc<Self> {
        Arc::new(Self {
            local_ip: local_ip.to_string(),
            hostname: hostname.to_string(),
        })
    }
}

#[async_trait]
impl MetadataClient for StaticMetadata {
    async fn get(&self, path: &str) -> Result<String> {
        match path {
            LOCAL_IPV4_PATH => Ok(self.local_ip.clone()),
            LOCAL_HOSTNAME_PATH => Ok(self.hostname.clone()),
            other => Err(Error::metadata(format!("unexpected path {}", other))),
        }
    }
}

/// Addon manifests by URL; anything else is a 404
#[derive(Default)]
pub struct StaticManifests {
    manifests: BTreeMap<String, String>,
}

impl StaticManifests {
    pub fn with(mut self, url: &str, body: &str) -> Self {
        self.manifests.insert(url.to_string(), body.to_string());
        self
    }
}

#[async_trait]
impl ManifestFetcher for StaticManifests {
    async fn fetch(&self, url: &str) -> Result<String> {
        self.manifests
            .get(url)
            .cloned()
            .ok_or_else(|| Error::addon(url, "HTTP 404 Not Found"))
    }
}

/// A cluster whose control-plane node is already Ready
pub struct ReadyCluster;

#[async_trait]
impl ClusterProbe for ReadyCluster {
    async fn node_counts(&self) -> Result<NodeCounts> {
        Ok(NodeCounts {
            control_plane_ready: 1,
            control_plane_total: 1,
            ..NodeCounts::default()
        })
    }
}

pub fn collaborators(
    host: &Arc<ScriptedHost>,
    metadata: Arc<StaticMetadata>,
    manifests: StaticManifests,
) -> Collaborators {
    Collaborators {
        runner: host.clone(),
        metadata,
        fetcher: Arc::new(manifests),
        probe: Arc::new(ReadyCluster),
    }
}

/// Where a host path lands under the test root
pub fn on_host(root: &Path, path: &Path) -> PathBuf {
    root.join(path.strip_prefix("/").unwrap_or(path))
}
