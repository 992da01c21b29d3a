//! Container runtime installation
//!
//! Prepares the kernel and installs containerd so that the kubelet finds a
//! live CRI socket. Every sub-step is safe to repeat on a host that already
//! ran it, and any failure is reported as
//! [`Error::RuntimeInstallFailure`] naming the sub-step.

use std::time::Duration;

use tracing::{debug, info};

use crate::config::{CgroupDriver, RuntimeSettings};
use crate::exec::{run_checked, CommandRunner, Invocation};
use crate::host::{pinned_package, Apt, HostFs};
use crate::retry::{retry_until, RetryConfig, RetryFailure};
use crate::{Error, Result};

/// Kernel modules loaded at boot for container networking
pub const MODULES_LOAD_PATH: &str = "/etc/modules-load.d/containerd.conf";
/// Persistent kernel network parameters
pub const SYSCTL_PATH: &str = "/etc/sysctl.d/99-kubernetes-cri.conf";
/// containerd configuration file
pub const CONTAINERD_CONFIG_PATH: &str = "/etc/containerd/config.toml";

const KERNEL_MODULES: &[&str] = &["overlay", "br_netfilter"];

const SYSCTL_SETTINGS: &str = "\
net.bridge.bridge-nf-call-iptables = 1
net.bridge.bridge-nf-call-ip6tables = 1
net.ipv4.ip_forward = 1
";

const RUNC_OPTIONS_TABLE: &str =
    "[plugins.\"io.containerd.grpc.v1.cri\".containerd.runtimes.runc.options]";

/// Set `SystemdCgroup` in a containerd config to match the cgroup driver
///
/// Every existing `SystemdCgroup` line is replaced, keeping its
/// indentation. If there is none, the key is inserted under the runc
/// options table, and if that table is missing too it is appended.
pub fn force_systemd_cgroup(config: &str, driver: CgroupDriver) -> String {
    let value = driver == CgroupDriver::Systemd;
    let setting = format!("SystemdCgroup = {}", value);

    let mut replaced = false;
    let mut lines: Vec<String> = config
        .lines()
        .map(|line| {
            let trimmed = line.trim_start();
            if trimmed.starts_with("SystemdCgroup") {
                replaced = true;
                let indent = &line[..line.len() - trimmed.len()];
                format!("{}{}", indent, setting)
            } else {
                line.to_string()
            }
        })
        .collect();

    if !replaced {
        let table = lines.iter().position(|line| {
            let t = line.trim();
            t.starts_with('[') && t.ends_with("runtimes.runc.options]")
        });
        match table {
            Some(idx) => {
                let header = &lines[idx];
                let indent = &header[..header.len() - header.trim_start().len()];
                let entry = format!("{}  {}", indent, setting);
                lines.insert(idx + 1, entry);
            }
            None => {
                lines.push(String::new());
                lines.push(RUNC_OPTIONS_TABLE.to_string());
                lines.push(format!("  {}", setting));
            }
        }
    }

    let mut out = lines.join("\n");
    out.push('\n');
    out
}

/// Installs and starts containerd
pub struct RuntimeInstaller<'a, R: CommandRunner + ?Sized> {
    runner: &'a R,
    fs: &'a HostFs,
    settings: &'a RuntimeSettings,
}

impl<'a, R: CommandRunner + ?Sized> RuntimeInstaller<'a, R> {
    /// Create an installer
    pub fn new(runner: &'a R, fs: &'a HostFs, settings: &'a RuntimeSettings) -> Self {
        Self {
            runner,
            fs,
            settings,
        }
    }

    /// Run every sub-step and return once the runtime answers on its socket
    pub async fn install(&self) -> Result<()> {
        self.load_kernel_modules()
            .await
            .map_err(|e| Error::runtime("kernel-modules", e))?;
        self.apply_sysctl()
            .await
            .map_err(|e| Error::runtime("sysctl", e))?;
        self.install_package()
            .await
            .map_err(|e| Error::runtime("package", e))?;
        self.write_config()
            .await
            .map_err(|e| Error::runtime("config", e))?;
        self.restart()
            .await
            .map_err(|e| Error::runtime("restart", e))?;
        self.wait_ready().await?;
        info!(socket = %self.settings.socket, "Container runtime ready");
        Ok(())
    }

    async fn load_kernel_modules(&self) -> Result<()> {
        let mut contents = KERNEL_MODULES.join("\n");
        contents.push('\n');
        self.fs.write(MODULES_LOAD_PATH, &contents).await?;
        for module in KERNEL_MODULES {
            run_checked(self.runner, Invocation::new("modprobe").arg(*module)).await?;
        }
        Ok(())
    }

    async fn apply_sysctl(&self) -> Result<()> {
        self.fs.write(SYSCTL_PATH, SYSCTL_SETTINGS).await?;
        run_checked(self.runner, Invocation::new("sysctl").arg("--system")).await?;
        Ok(())
    }

    async fn install_package(&self) -> Result<()> {
        let package = match &self.settings.version {
            Some(version) => pinned_package(&self.settings.package, version),
            None => self.settings.package.clone(),
        };
        let apt = Apt::new(self.runner);
        apt.update().await?;
        apt.install(&[package]).await
    }

    async fn write_config(&self) -> Result<()> {
        let defaults = run_checked(
            self.runner,
            Invocation::new("containerd").args(["config", "default"]),
        )
        .await?;
        let config = force_systemd_cgroup(&defaults.stdout, self.settings.cgroup_driver);
        self.fs.write(CONTAINERD_CONFIG_PATH, &config).await
    }

    async fn restart(&self) -> Result<()> {
        run_checked(
            self.runner,
            Invocation::new("systemctl").args(["enable", "containerd"]),
        )
        .await?;
        run_checked(
            self.runner,
            Invocation::new("systemctl").args(["restart", "containerd"]),
        )
        .await?;
        Ok(())
    }

    async fn wait_ready(&self) -> Result<()> {
        let timeout = self.settings.ready_timeout;
        let probe = Invocation::new("ctr").args([
            "--address",
            self.settings.socket.as_str(),
            "version",
        ]);
        let config = RetryConfig {
            max_attempts: 0,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 2.0,
        };

        let result = retry_until(&config, timeout, "containerd-ready", |_| true, |_| {
            let probe = &probe;
            async move {
                debug!(command = %probe, "Probing runtime socket");
                run_checked(self.runner, probe.clone()).await
            }
        })
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(RetryFailure::Permanent(e)) => Err(Error::runtime("ready", e)),
            Err(RetryFailure::DeadlineExceeded { last, attempts }) => Err(Error::runtime(
                "ready",
                format!(
                    "runtime socket not ready after {:?} ({} attempts): {}",
                    timeout, attempts, last
                ),
            )),
        }
    }
}
