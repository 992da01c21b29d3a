//! Kubernetes tooling installation
//!
//! Installs kubelet, kubeadm and kubectl from the upstream pkgs.k8s.io
//! repository at exactly the cluster's pinned version and holds them there,
//! so the control plane and every worker run the same toolchain. Swap must
//! be off before the kubelet starts; a host that still has swap after
//! `swapoff` fails here rather than in a crash-looping kubelet later.

use tracing::{info, warn};

use crate::config::{KubernetesVersion, ToolingSettings};
use crate::exec::{run_checked, CommandRunner, Invocation};
use crate::host::{pinned_package, Apt, HostFs};
use crate::{Error, Result};

/// Keyring the upstream repository is signed with
pub const KEYRING_PATH: &str = "/etc/apt/keyrings/kubernetes-apt-keyring.gpg";
/// apt source for the upstream repository
pub const SOURCES_LIST_PATH: &str = "/etc/apt/sources.list.d/kubernetes.list";
/// Static file system table
pub const FSTAB_PATH: &str = "/etc/fstab";
/// Kernel view of active swap devices
pub const PROC_SWAPS_PATH: &str = "/proc/swaps";

const PREREQUISITES: &[&str] = &["apt-transport-https", "ca-certificates", "curl", "gpg"];
const TOOLS: &[&str] = &["kubelet", "kubeadm", "kubectl"];

/// Comment out every active swap entry in an fstab
///
/// Returns `None` when nothing needed changing.
pub fn disable_swap_entries(fstab: &str) -> Option<String> {
    let mut changed = false;
    let mut out: Vec<String> = fstab
        .lines()
        .map(|line| {
            let trimmed = line.trim_start();
            let is_swap = !trimmed.starts_with('#')
                && trimmed.split_whitespace().nth(2) == Some("swap");
            if is_swap {
                changed = true;
                format!("# {}", line)
            } else {
                line.to_string()
            }
        })
        .collect();
    if !changed {
        return None;
    }
    out.push(String::new());
    Some(out.join("\n"))
}

/// Active swap devices listed in `/proc/swaps` (header line skipped)
pub fn active_swap_devices(proc_swaps: &str) -> Vec<String> {
    proc_swaps
        .lines()
        .skip(1)
        .filter_map(|line| line.split_whitespace().next())
        .map(str::to_string)
        .collect()
}

/// Installs the Kubernetes toolchain
pub struct ToolingInstaller<'a, R: CommandRunner + ?Sized> {
    runner: &'a R,
    fs: &'a HostFs,
    settings: &'a ToolingSettings,
    version: KubernetesVersion,
}

impl<'a, R: CommandRunner + ?Sized> ToolingInstaller<'a, R> {
    /// Create an installer for `version`
    pub fn new(
        runner: &'a R,
        fs: &'a HostFs,
        settings: &'a ToolingSettings,
        version: KubernetesVersion,
    ) -> Self {
        Self {
            runner,
            fs,
            settings,
            version,
        }
    }

    fn repository_url(&self) -> String {
        format!(
            "{}/{}/deb/",
            self.settings.apt_repository.trim_end_matches('/'),
            self.version.series()
        )
    }

    /// Run every sub-step; re-running on a provisioned host is a no-op
    pub async fn install(&self) -> Result<()> {
        let apt = Apt::new(self.runner);
        let prerequisites: Vec<String> = PREREQUISITES.iter().map(|p| p.to_string()).collect();
        apt.install(&prerequisites)
            .await
            .map_err(|e| Error::tooling("prerequisites", e))?;

        self.register_repository()
            .await
            .map_err(|e| Error::tooling("repository", e))?;

        self.install_tools(&apt)
            .await
            .map_err(|e| Error::tooling("packages", e))?;

        self.disable_swap().await?;

        run_checked(
            self.runner,
            Invocation::new("systemctl").args(["enable", "--now", "kubelet"]),
        )
        .await
        .map_err(|e| Error::tooling("kubelet", e))?;

        info!(version = %self.version, "Kubernetes tooling installed");
        Ok(())
    }

    async fn register_repository(&self) -> Result<()> {
        let repo = self.repository_url();

        if self.fs.exists(KEYRING_PATH).await {
            info!(path = KEYRING_PATH, "Repository key already present");
        } else {
            let key = run_checked(
                self.runner,
                Invocation::new("curl")
                    .arg("-fsSL")
                    .arg(format!("{}Release.key", repo)),
            )
            .await?;
            self.fs.create_dir_all("/etc/apt/keyrings").await?;
            let target = self.fs.resolve(KEYRING_PATH);
            run_checked(
                self.runner,
                Invocation::new("gpg")
                    .args(["--batch", "--yes", "--dearmor", "-o"])
                    .arg(target.display().to_string())
                    .stdin(key.stdout),
            )
            .await?;
        }

        let source = format!("deb [signed-by={}] {} /\n", KEYRING_PATH, repo);
        self.fs.write(SOURCES_LIST_PATH, &source).await?;
        Apt::new(self.runner).update().await
    }

    async fn install_tools(&self, apt: &Apt<'_, R>) -> Result<()> {
        if let Err(e) = apt.unhold(TOOLS).await {
            warn!(error = %e, "apt-mark unhold failed, continuing");
        }
        let version = self.version.to_string();
        let packages: Vec<String> = TOOLS
            .iter()
            .map(|tool| pinned_package(tool, &version))
            .collect();
        apt.install(&packages).await?;
        apt.hold(TOOLS).await
    }

    async fn disable_swap(&self) -> Result<()> {
        run_checked(self.runner, Invocation::new("swapoff").arg("-a"))
            .await
            .map_err(|e| Error::tooling("swap", e))?;

        if let Some(fstab) = self
            .fs
            .read_optional(FSTAB_PATH)
            .await
            .map_err(|e| Error::tooling("swap", e))?
        {
            if let Some(updated) = disable_swap_entries(&fstab) {
                info!("Commenting out swap entries in /etc/fstab");
                self.fs
                    .write(FSTAB_PATH, &updated)
                    .await
                    .map_err(|e| Error::tooling("swap", e))?;
            }
        }

        let swaps = self
            .fs
            .read_optional(PROC_SWAPS_PATH)
            .await
            .map_err(|e| Error::tooling("swap", e))?
            .unwrap_or_default();
        let active = active_swap_devices(&swaps);
        if !active.is_empty() {
            return Err(Error::tooling(
                "swap",
                format!("swap still enabled on {}", active.join(", ")),
            ));
        }
        Ok(())
    }
}
