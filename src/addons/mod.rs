//! Addon installation
//!
//! Addons are remotely hosted manifests applied once the control plane is
//! Ready. Each one is fetched, has `$VAR` / `${VAR}` references substituted
//! from an explicit variable map, is written to a temporary file, applied
//! and discarded. One addon failing does not stop the others.

use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::config::{AddonDescriptor, BootstrapConfig};
use crate::exec::CommandRunner;
use crate::host::HostFs;
use crate::kubeadm::ADMIN_KUBECONFIG;
use crate::kubectl::Kubectl;
use crate::manifest;
use crate::{Error, Result};

/// Default HTTP timeout for manifest downloads
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Substitute `$VAR` and `${VAR}` references from `vars`
///
/// References to variables not in `vars` are left exactly as written, so
/// manifests that carry their own shell snippets survive untouched.
pub fn substitute(text: &str, vars: &BTreeMap<String, String>) -> String {
    let is_start = |c: char| c.is_ascii_alphabetic() || c == '_';
    let is_part = |c: char| c.is_ascii_alphanumeric() || c == '_';

    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];

        if let Some(braced) = after.strip_prefix('{') {
            if let Some(end) = braced.find('}') {
                let name = &braced[..end];
                let valid = name.starts_with(is_start) && name.chars().all(is_part);
                if let (true, Some(value)) = (valid, vars.get(name)) {
                    out.push_str(value);
                    rest = &braced[end + 1..];
                    continue;
                }
            }
        } else if after.starts_with(is_start) {
            let len = after.find(|c: char| !is_part(c)).unwrap_or(after.len());
            if let Some(value) = vars.get(&after[..len]) {
                out.push_str(value);
                rest = &after[len..];
                continue;
            }
        }

        out.push('$');
        rest = after;
    }
    out.push_str(rest);
    out
}

/// Trait for downloading manifests (allows mocking in tests)
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ManifestFetcher: Send + Sync {
    /// Fetch the manifest body at `url`
    async fn fetch(&self, url: &str) -> Result<String>;
}

/// [`ManifestFetcher`] over HTTP(S)
pub struct HttpManifestFetcher {
    client: reqwest::Client,
}

impl HttpManifestFetcher {
    /// Create a fetcher with the default timeout
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(DEFAULT_FETCH_TIMEOUT)
            .build()
            .map_err(|e| Error::configuration("http client", e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ManifestFetcher for HttpManifestFetcher {
    async fn fetch(&self, url: &str) -> Result<String> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| Error::addon(url, format!("request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(Error::addon(url, format!("HTTP {}", response.status())));
        }

        response
            .text()
            .await
            .map_err(|e| Error::addon(url, format!("unreadable body: {}", e)))
    }
}

/// Result of applying one addon
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "message", rename_all = "lowercase")]
pub enum AddonOutcome {
    /// Manifest applied
    Applied,
    /// Fetch, write or apply failed
    Failed(String),
}

/// Per-addon report
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct AddonReport {
    /// Manifest URL
    pub url: String,
    /// What happened
    pub outcome: AddonOutcome,
}

impl AddonReport {
    /// Whether the addon was applied
    pub fn succeeded(&self) -> bool {
        self.outcome == AddonOutcome::Applied
    }
}

/// Applies the configured addons in order
pub struct AddonInstaller<'a, R: CommandRunner + ?Sized> {
    runner: &'a R,
    fs: &'a HostFs,
    fetcher: &'a dyn ManifestFetcher,
    cfg: &'a BootstrapConfig,
}

impl<'a, R: CommandRunner + ?Sized> AddonInstaller<'a, R> {
    /// Create an installer
    pub fn new(
        runner: &'a R,
        fs: &'a HostFs,
        fetcher: &'a dyn ManifestFetcher,
        cfg: &'a BootstrapConfig,
    ) -> Self {
        Self {
            runner,
            fs,
            fetcher,
            cfg,
        }
    }

    /// Apply every addon once, in declaration order
    pub async fn install_all(&self) -> Vec<AddonReport> {
        let mut seen = HashSet::new();
        let mut reports = Vec::new();
        for addon in &self.cfg.addons {
            if !seen.insert(addon.url.as_str()) {
                warn!(url = %addon.url, "Addon listed twice, applying once");
                continue;
            }
            let outcome = match self.install(addon).await {
                Ok(()) => {
                    info!(url = %addon.url, "Addon applied");
                    AddonOutcome::Applied
                }
                Err(e) => {
                    error!(url = %addon.url, error = %e, "Addon failed");
                    AddonOutcome::Failed(e.to_string())
                }
            };
            reports.push(AddonReport {
                url: addon.url.clone(),
                outcome,
            });
        }
        reports
    }

    async fn install(&self, addon: &AddonDescriptor) -> Result<()> {
        let body = self.fetcher.fetch(&addon.url).await?;
        let rendered = substitute(&body, &self.cfg.addon_env);
        let file = manifest::write_temp("addon-", &rendered)
            .map_err(|e| Error::addon(&addon.url, e))?;

        let admin = self.fs.resolve(ADMIN_KUBECONFIG);
        Kubectl::new(self.runner, admin.display().to_string())
            .apply_file(file.path())
            .await
            .map_err(|e| Error::addon(&addon.url, e))?;
        Ok(())
    }
}
