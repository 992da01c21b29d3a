//! kubeadm manifest rendering
//!
//! `kubeadm init` and `kubeadm join` are driven by multi-document YAML
//! configuration files. The documents are built in memory as JSON values,
//! validated, then serialized to a temporary file that lives only as long
//! as the single CLI invocation that reads it.
//!
//! kubeadm 1.31 switched to the `v1beta4` config API, where extra args are
//! lists of `{name, value}` pairs instead of maps and the discovery timeout
//! moved under `timeouts`. The rendered API version follows the pinned
//! Kubernetes version.

use std::collections::BTreeSet;
use std::io::Write;
use std::net::IpAddr;

use serde_json::{json, Value};
use tempfile::NamedTempFile;
use tracing::debug;

use crate::config::{BootstrapConfig, Cidr, KubernetesVersion};
use crate::identity::{normalize_dns_name, NodeIdentity};
use crate::token::{go_duration, BootstrapToken};
use crate::{Error, Result};

/// kubeadm config API used up to Kubernetes 1.30
pub const KUBEADM_V1BETA3: &str = "kubeadm.k8s.io/v1beta3";
/// kubeadm config API used from Kubernetes 1.31
pub const KUBEADM_V1BETA4: &str = "kubeadm.k8s.io/v1beta4";
/// Kubelet config API
pub const KUBELET_CONFIG_API: &str = "kubelet.config.k8s.io/v1beta1";

const DEFAULT_NODE_TOKEN_GROUP: &str = "system:bootstrappers:kubeadm:default-node-token";

/// kubeadm config API version for a Kubernetes release
pub fn kubeadm_api_version(version: &KubernetesVersion) -> &'static str {
    if version.uses_kubeadm_v1beta4() {
        KUBEADM_V1BETA4
    } else {
        KUBEADM_V1BETA3
    }
}

/// Every name and address the API server certificate must be valid for
///
/// Order is `[dns, public IP, local IP, hostname]`, deduplicated keeping
/// the first occurrence (the public and local IP coincide on some setups).
pub fn cert_sans(
    dns_name: &str,
    public_ip: IpAddr,
    local_ip: IpAddr,
    hostname: &str,
) -> Vec<String> {
    let mut seen = BTreeSet::new();
    [
        normalize_dns_name(dns_name),
        public_ip.to_string(),
        local_ip.to_string(),
        normalize_dns_name(hostname),
    ]
    .into_iter()
    .filter(|san| seen.insert(san.clone()))
    .collect()
}

/// Kubelet flags, rendered as a map (v1beta3) or a list of pairs (v1beta4)
fn kubelet_extra_args(api: &str, args: &[(&str, String)]) -> Value {
    if api == KUBEADM_V1BETA4 {
        Value::Array(
            args.iter()
                .map(|(name, value)| json!({"name": name, "value": value}))
                .collect(),
        )
    } else {
        Value::Object(
            args.iter()
                .map(|(name, value)| (name.to_string(), Value::String(value.clone())))
                .collect(),
        )
    }
}

fn node_registration(cfg: &BootstrapConfig, identity: &NodeIdentity, api: &str) -> Value {
    let mut args = vec![("node-ip", identity.local_ip.to_string())];
    if let Some(provider) = &cfg.registration.cloud_provider {
        args.push(("cloud-provider", provider.clone()));
    }
    json!({
        "name": identity.hostname,
        "criSocket": cfg.runtime.cri_endpoint(),
        "imagePullPolicy": cfg.registration.image_pull_policy,
        "kubeletExtraArgs": kubelet_extra_args(api, &args),
    })
}

fn kubelet_configuration(cfg: &BootstrapConfig) -> Value {
    json!({
        "apiVersion": KUBELET_CONFIG_API,
        "kind": "KubeletConfiguration",
        "cgroupDriver": cfg.runtime.cgroup_driver.as_str(),
        "readOnlyPort": 0,
    })
}

fn documents_to_yaml(documents: &[&Value]) -> Result<String> {
    let mut out = String::new();
    for (i, doc) in documents.iter().enumerate() {
        if i > 0 {
            out.push_str("---\n");
        }
        out.push_str(&serde_yaml::to_string(doc)?);
    }
    Ok(out)
}

/// Write a rendered manifest to a private temporary file
///
/// The file is removed when the returned handle is dropped. It is created
/// with mode 0600 since init and join manifests embed the bootstrap token.
pub fn write_temp(prefix: &str, yaml: &str) -> Result<NamedTempFile> {
    let mut file = tempfile::Builder::new()
        .prefix(prefix)
        .suffix(".yaml")
        .tempfile()?;
    file.write_all(yaml.as_bytes())?;
    file.flush()?;
    debug!(path = %file.path().display(), "Wrote kubeadm manifest");
    Ok(file)
}

fn str_at<'a>(value: &'a Value, pointer: &str) -> Option<&'a str> {
    value.pointer(pointer).and_then(Value::as_str)
}

// =============================================================================
// Init manifest
// =============================================================================

/// Rendered `kubeadm init` configuration
#[derive(Clone, Debug)]
pub struct InitManifest {
    identity: NodeIdentity,
    cert_sans: Vec<String>,
    init: Value,
    cluster: Value,
    kubelet: Value,
}

impl InitManifest {
    /// Render and validate the init manifest for this control-plane node
    pub fn render(cfg: &BootstrapConfig, identity: &NodeIdentity) -> Result<Self> {
        let params = &cfg.cluster;
        let api = kubeadm_api_version(&params.kubernetes_version);
        let token = &params.bootstrap_token;

        let sans = cert_sans(
            &params.cluster_dns_name,
            params.cluster_public_ip,
            identity.local_ip,
            &identity.hostname,
        );

        let init = json!({
            "apiVersion": api,
            "kind": "InitConfiguration",
            "bootstrapTokens": [{
                "token": token.expose(),
                "ttl": token.ttl_string(),
                "usages": ["signing", "authentication"],
                "groups": [DEFAULT_NODE_TOKEN_GROUP],
            }],
            "localAPIEndpoint": {
                "advertiseAddress": identity.local_ip.to_string(),
                "bindPort": params.api_server_port,
            },
            "nodeRegistration": node_registration(cfg, identity, api),
        });

        let cluster = json!({
            "apiVersion": api,
            "kind": "ClusterConfiguration",
            "clusterName": params.cluster_name,
            "kubernetesVersion": params.kubernetes_version.tag(),
            "controlPlaneEndpoint": params.control_plane_endpoint(),
            "apiServer": {
                "certSANs": sans,
            },
            "networking": {
                "podSubnet": params.pod_subnet.to_string(),
                "serviceSubnet": params.service_subnet.to_string(),
            },
        });

        let manifest = Self {
            identity: identity.clone(),
            cert_sans: sans,
            init,
            cluster,
            kubelet: kubelet_configuration(cfg),
        };
        manifest.validate(cfg)?;
        Ok(manifest)
    }

    /// SAN list embedded in the ClusterConfiguration
    pub fn cert_sans(&self) -> &[String] {
        &self.cert_sans
    }

    /// Check the rendered documents before kubeadm sees them
    ///
    /// Runs against the rendered values, not the inputs, so a rendering
    /// bug is caught as a configuration error instead of a kubeadm failure.
    pub fn validate(&self, cfg: &BootstrapConfig) -> Result<()> {
        let name = str_at(&self.init, "/nodeRegistration/name").unwrap_or_default();
        if name != self.identity.hostname || name != normalize_dns_name(name) {
            return Err(Error::configuration(
                "nodeRegistration.name",
                format!(
                    "node name '{}' does not match kubelet hostname '{}'",
                    name, self.identity.hostname
                ),
            ));
        }

        let cidr = |pointer: &str, field: &str| -> Result<Cidr> {
            str_at(&self.cluster, pointer)
                .ok_or_else(|| Error::configuration(field, "missing"))?
                .parse()
                .map_err(|e: String| Error::configuration(field, e))
        };
        let pods = cidr("/networking/podSubnet", "networking.podSubnet")?;
        let services = cidr("/networking/serviceSubnet", "networking.serviceSubnet")?;
        if pods.overlaps(&services) {
            return Err(Error::configuration(
                "networking.podSubnet",
                format!("pod subnet {} overlaps service subnet {}", pods, services),
            ));
        }

        let rendered: Vec<&str> = self
            .cluster
            .pointer("/apiServer/certSANs")
            .and_then(Value::as_array)
            .map(|sans| sans.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();
        let required = cert_sans(
            &cfg.cluster.cluster_dns_name,
            cfg.cluster.cluster_public_ip,
            self.identity.local_ip,
            &self.identity.hostname,
        );
        for san in &required {
            if !rendered.contains(&san.as_str()) {
                return Err(Error::configuration(
                    "apiServer.certSANs",
                    format!("missing {}", san),
                ));
            }
        }

        let token = str_at(&self.init, "/bootstrapTokens/0/token").unwrap_or_default();
        BootstrapToken::parse(token)?;

        Ok(())
    }

    /// The full multi-document manifest for `kubeadm init --config`
    pub fn to_yaml(&self) -> Result<String> {
        documents_to_yaml(&[&self.init, &self.cluster, &self.kubelet])
    }

    /// Only the ClusterConfiguration, as `kubeadm kubeconfig user` expects
    pub fn cluster_configuration_yaml(&self) -> Result<String> {
        documents_to_yaml(&[&self.cluster])
    }
}

// =============================================================================
// Join manifest
// =============================================================================

/// Rendered `kubeadm join` configuration
#[derive(Clone, Debug)]
pub struct JoinManifest {
    join: Value,
    kubelet: Value,
}

impl JoinManifest {
    /// Render the join manifest for this worker
    pub fn render(cfg: &BootstrapConfig, identity: &NodeIdentity) -> Result<Self> {
        cfg.join.validate()?;
        let params = &cfg.cluster;
        let api = kubeadm_api_version(&params.kubernetes_version);
        let timeout = go_duration(cfg.join.kubeadm_discovery_timeout());

        let mut join = json!({
            "apiVersion": api,
            "kind": "JoinConfiguration",
            "discovery": {
                "bootstrapToken": {
                    "apiServerEndpoint": params.join_endpoint(),
                    "token": params.bootstrap_token.expose(),
                    "caCertHashes": cfg.join.ca_cert_hashes,
                    "unsafeSkipCAVerification": cfg.join.unsafe_skip_ca_verification,
                },
            },
            "nodeRegistration": node_registration(cfg, identity, api),
        });

        if api == KUBEADM_V1BETA4 {
            join["timeouts"] = json!({ "discovery": timeout });
        } else {
            join["discovery"]["timeout"] = json!(timeout);
        }

        Ok(Self {
            join,
            kubelet: kubelet_configuration(cfg),
        })
    }

    /// The full multi-document manifest for `kubeadm join --config`
    pub fn to_yaml(&self) -> Result<String> {
        documents_to_yaml(&[&self.join, &self.kubelet])
    }
}
