//! Cluster-admin credential provisioning
//!
//! Grants the operator identity cluster-admin, renders one client
//! kubeconfig for it and writes two copies that differ only in the API
//! server address: one by DNS name for normal use and one by public IP for
//! when DNS is not (yet) resolvable. Both are owned by the operational user
//! and readable only by them.

use std::fmt;
use std::path::PathBuf;

use serde::Serialize;
use tracing::{debug, info};

use crate::config::{AccessSettings, BootstrapConfig};
use crate::exec::{run_checked, CommandRunner, Invocation};
use crate::host::HostFs;
use crate::kubeadm::{Kubeadm, ADMIN_KUBECONFIG};
use crate::kubectl::Kubectl;
use crate::manifest::{self, InitManifest};
use crate::{Error, Result};

/// Permission bits of the written kubeconfigs
pub const KUBECONFIG_MODE: u32 = 0o600;

/// Which address a kubeconfig's server field uses
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressMode {
    /// The cluster DNS name
    Dns,
    /// The cluster public IP
    Ip,
}

impl fmt::Display for AddressMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Dns => write!(f, "dns"),
            Self::Ip => write!(f, "ip"),
        }
    }
}

/// A kubeconfig written for the operational user
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KubeconfigArtifact {
    /// Host path of the file
    pub path: PathBuf,
    /// Address the server field points at
    pub address_mode: AddressMode,
    /// Server URL written into the file
    pub server: String,
    /// Owning user
    pub owner: String,
    /// Permission bits
    pub mode: u32,
}

/// Replace `clusters[*].cluster.server` and leave everything else intact
pub fn rewrite_server(kubeconfig: &str, server: &str) -> Result<String> {
    let mut doc: serde_yaml::Value = serde_yaml::from_str(kubeconfig)?;

    let mut updated = 0;
    if let Some(clusters) = doc.get_mut("clusters").and_then(|c| c.as_sequence_mut()) {
        for cluster in clusters {
            if let Some(entry) = cluster.get_mut("cluster").and_then(|c| c.get_mut("server")) {
                debug!(
                    old_server = entry.as_str().unwrap_or("unknown"),
                    new_server = %server,
                    "Rewriting kubeconfig server"
                );
                *entry = serde_yaml::Value::String(server.to_string());
                updated += 1;
            }
        }
    }

    if updated == 0 {
        return Err(Error::credential(
            "rewrite-server",
            "kubeconfig has no clusters[].cluster.server entry",
        ));
    }
    Ok(serde_yaml::to_string(&doc)?)
}

fn https_url(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("https://[{}]:{}", host, port)
    } else {
        format!("https://{}:{}", host, port)
    }
}

/// Grants admin access and writes the operator kubeconfigs
pub struct CredentialProvisioner<'a, R: CommandRunner + ?Sized> {
    runner: &'a R,
    fs: &'a HostFs,
    cfg: &'a BootstrapConfig,
}

impl<'a, R: CommandRunner + ?Sized> CredentialProvisioner<'a, R> {
    /// Create a provisioner
    pub fn new(runner: &'a R, fs: &'a HostFs, cfg: &'a BootstrapConfig) -> Self {
        Self { runner, fs, cfg }
    }

    fn access(&self) -> &AccessSettings {
        &self.cfg.access
    }

    /// Bind the admin identity and write both kubeconfig variants
    pub async fn provision(&self, manifest: &InitManifest) -> Result<Vec<KubeconfigArtifact>> {
        self.bind_cluster_admin()
            .await
            .map_err(|e| Error::credential("role-binding", e))?;

        let rendered = self
            .render_kubeconfig(manifest)
            .await
            .map_err(|e| Error::credential("render", e))?;

        let port = self.cfg.cluster.api_server_port;
        let variants = [
            (
                AddressMode::Dns,
                &self.access().dns_kubeconfig,
                https_url(&self.cfg.cluster.cluster_dns_name, port),
            ),
            (
                AddressMode::Ip,
                &self.access().ip_kubeconfig,
                https_url(&self.cfg.cluster.cluster_public_ip.to_string(), port),
            ),
        ];

        let mut artifacts = Vec::with_capacity(variants.len());
        for (mode, file_name, server) in variants {
            let contents = rewrite_server(&rendered, &server)?;
            let path = self.access().home_dir.join(file_name);
            self.write_owned(&path, &contents)
                .await
                .map_err(|e| Error::credential("write", e))?;
            info!(path = %path.display(), address_mode = %mode, %server, "Wrote kubeconfig");
            artifacts.push(KubeconfigArtifact {
                path,
                address_mode: mode,
                server,
                owner: self.access().operational_user.clone(),
                mode: KUBECONFIG_MODE,
            });
        }
        Ok(artifacts)
    }

    async fn bind_cluster_admin(&self) -> Result<()> {
        let admin = self.fs.resolve(ADMIN_KUBECONFIG);
        let kubectl = Kubectl::new(self.runner, admin.display().to_string());
        let binding = self.access().binding_name();
        let user = format!("--user={}", self.access().admin_identity);
        kubectl
            .create_or_apply(&[
                "clusterrolebinding",
                binding.as_str(),
                "--clusterrole=cluster-admin",
                user.as_str(),
            ])
            .await?;
        info!(
            binding = %binding,
            identity = %self.access().admin_identity,
            "Cluster-admin binding applied"
        );
        Ok(())
    }

    async fn render_kubeconfig(&self, manifest: &InitManifest) -> Result<String> {
        let cluster_config = manifest::write_temp(
            "kubeadm-cluster-",
            &manifest.cluster_configuration_yaml()?,
        )?;
        let kubeadm = Kubeadm::new(self.runner, self.cfg.runtime.cri_endpoint());
        kubeadm
            .kubeconfig_user(&self.access().admin_identity, cluster_config.path())
            .await
    }

    async fn write_owned(&self, path: &std::path::Path, contents: &str) -> Result<()> {
        self.fs
            .write_with_mode(path, contents, KUBECONFIG_MODE)
            .await?;
        let user = &self.access().operational_user;
        run_checked(
            self.runner,
            Invocation::new("chown")
                .arg(format!("{}:{}", user, user))
                .arg(self.fs.resolve(path).display().to_string()),
        )
        .await?;
        Ok(())
    }
}
