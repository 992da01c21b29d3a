//! Ordered bootstrap pipeline
//!
//! A node's bootstrap is a fixed sequence of named steps. Each step is
//! timed and recorded in a [`BootstrapReport`]; the first fatal failure
//! stops the sequence and is returned as a [`BootstrapFailure`] carrying
//! the report so far. Addon installation is the only step that can end
//! `Partial` instead of failing the run.
//!
//! Control plane: resolve-identity, install-runtime, install-tooling,
//! initialize-control-plane, provision-access, install-addons.
//!
//! Worker: resolve-identity, install-runtime, install-tooling, join-cluster.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::addons::{AddonInstaller, AddonReport, HttpManifestFetcher, ManifestFetcher};
use crate::config::{BootstrapConfig, NodeRole};
use crate::controlplane::ControlPlaneInitializer;
use crate::credentials::{CredentialProvisioner, KubeconfigArtifact};
use crate::exec::{CommandRunner, HostCommandRunner};
use crate::host::HostFs;
use crate::identity::{HttpMetadataClient, MetadataClient, NodeIdentity, NodeIdentityResolver};
use crate::join::NodeJoiner;
use crate::kubeadm::ADMIN_KUBECONFIG;
use crate::probe::{ClusterProbe, KubeProbe};
use crate::runtime::RuntimeInstaller;
use crate::tooling::ToolingInstaller;
use crate::{Error, Result};

/// Step names, in execution order
pub mod steps {
    /// Query instance metadata
    pub const RESOLVE_IDENTITY: &str = "resolve-identity";
    /// Kernel settings and containerd
    pub const INSTALL_RUNTIME: &str = "install-runtime";
    /// kubelet, kubeadm, kubectl
    pub const INSTALL_TOOLING: &str = "install-tooling";
    /// kubeadm init, overlay, readiness
    pub const INITIALIZE_CONTROL_PLANE: &str = "initialize-control-plane";
    /// Admin binding and kubeconfigs
    pub const PROVISION_ACCESS: &str = "provision-access";
    /// Remote addon manifests
    pub const INSTALL_ADDONS: &str = "install-addons";
    /// kubeadm join
    pub const JOIN_CLUSTER: &str = "join-cluster";
}

/// How a step ended
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "message", rename_all = "lowercase")]
pub enum StepOutcome {
    /// Step completed
    Succeeded,
    /// Step failed; carries the diagnostics
    Failed(String),
    /// Step completed with some non-fatal failures
    Partial(String),
}

/// One executed step
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StepReport {
    /// Step name
    pub name: String,
    /// How it ended
    pub outcome: StepOutcome,
    /// Wall-clock time spent in the step
    #[serde(rename = "elapsedMs", serialize_with = "as_millis")]
    pub elapsed: Duration,
}

fn as_millis<S: serde::Serializer>(d: &Duration, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

/// Everything a bootstrap run did
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BootstrapReport {
    /// Role the node bootstrapped as
    pub role: NodeRole,
    /// Executed steps, in order
    pub steps: Vec<StepReport>,
    /// Resolved identity, once known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity: Option<NodeIdentity>,
    /// Kubeconfigs written for the operator
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub kubeconfigs: Vec<KubeconfigArtifact>,
    /// Per-addon results
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub addons: Vec<AddonReport>,
}

impl BootstrapReport {
    fn new(role: NodeRole) -> Self {
        Self {
            role,
            steps: Vec::new(),
            identity: None,
            kubeconfigs: Vec::new(),
            addons: Vec::new(),
        }
    }

    /// Whether no step failed
    pub fn succeeded(&self) -> bool {
        !self
            .steps
            .iter()
            .any(|s| matches!(s.outcome, StepOutcome::Failed(_)))
    }

    /// The step that failed, if any
    pub fn failed_step(&self) -> Option<&StepReport> {
        self.steps
            .iter()
            .find(|s| matches!(s.outcome, StepOutcome::Failed(_)))
    }

    /// Names of executed steps, in order
    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.name.as_str()).collect()
    }
}

impl fmt::Display for BootstrapReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} bootstrap:", self.role)?;
        for step in &self.steps {
            let (status, detail) = match &step.outcome {
                StepOutcome::Succeeded => ("ok", None),
                StepOutcome::Failed(m) => ("FAILED", Some(m)),
                StepOutcome::Partial(m) => ("partial", Some(m)),
            };
            write!(
                f,
                "  {:<26} {:<8} {:>8.1}s",
                step.name,
                status,
                step.elapsed.as_secs_f64()
            )?;
            if let Some(detail) = detail {
                write!(f, "  {}", detail)?;
            }
            writeln!(f)?;
        }
        for kc in &self.kubeconfigs {
            writeln!(f, "  kubeconfig ({}): {}", kc.address_mode, kc.path.display())?;
        }
        Ok(())
    }
}

/// A bootstrap run that stopped at a fatal step
#[derive(Debug, thiserror::Error)]
#[error("bootstrap step {step} failed: {source}")]
pub struct BootstrapFailure {
    /// Name of the failing step
    pub step: String,
    /// Report up to and including the failing step
    pub report: BootstrapReport,
    /// Underlying error
    #[source]
    pub source: Error,
}

/// Records step outcomes as the sequence runs
pub struct Pipeline {
    report: BootstrapReport,
    failed_step: Option<String>,
}

impl Pipeline {
    /// Start an empty pipeline for `role`
    pub fn new(role: NodeRole) -> Self {
        Self {
            report: BootstrapReport::new(role),
            failed_step: None,
        }
    }

    /// Run one step, recording its outcome and duration
    pub async fn step<T, Fut>(&mut self, name: &str, fut: Fut) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
    {
        info!(step = name, "Starting step");
        let started = Instant::now();
        let result = fut.await;
        let elapsed = started.elapsed();

        let outcome = match &result {
            Ok(_) => {
                info!(step = name, elapsed_ms = elapsed.as_millis() as u64, "Step succeeded");
                StepOutcome::Succeeded
            }
            Err(e) => {
                error!(
                    step = name,
                    elapsed_ms = elapsed.as_millis() as u64,
                    error = %e,
                    "Step failed"
                );
                self.failed_step = Some(name.to_string());
                StepOutcome::Failed(e.to_string())
            }
        };
        self.record(name, outcome, elapsed);
        result
    }

    /// Record an outcome computed outside [`Pipeline::step`]
    pub fn record(&mut self, name: &str, outcome: StepOutcome, elapsed: Duration) {
        if let StepOutcome::Failed(_) = outcome {
            self.failed_step = Some(name.to_string());
        }
        self.report.steps.push(StepReport {
            name: name.to_string(),
            outcome,
            elapsed,
        });
    }

    /// Mutable access to the report for attaching artifacts
    pub fn report_mut(&mut self) -> &mut BootstrapReport {
        &mut self.report
    }

    /// Finish successfully
    pub fn finish(self) -> BootstrapReport {
        self.report
    }

    /// Finish with the error that stopped the sequence
    pub fn fail(self, source: Error) -> BootstrapFailure {
        BootstrapFailure {
            step: self
                .failed_step
                .unwrap_or_else(|| "unknown".to_string()),
            report: self.report,
            source,
        }
    }
}

/// External systems the bootstrap talks to
#[derive(Clone)]
pub struct Collaborators {
    /// Runs host commands
    pub runner: Arc<dyn CommandRunner>,
    /// Reads instance metadata
    pub metadata: Arc<dyn MetadataClient>,
    /// Downloads addon manifests
    pub fetcher: Arc<dyn ManifestFetcher>,
    /// Queries node readiness
    pub probe: Arc<dyn ClusterProbe>,
}

impl Collaborators {
    /// Real implementations for running on the host described by `cfg`
    pub fn host(cfg: &BootstrapConfig) -> Result<Self> {
        let fs = HostFs::new(&cfg.host_root);
        Ok(Self {
            runner: Arc::new(HostCommandRunner),
            metadata: Arc::new(HttpMetadataClient::new(&cfg.metadata_endpoint)?),
            fetcher: Arc::new(HttpManifestFetcher::new()?),
            probe: Arc::new(KubeProbe::new(fs.resolve(ADMIN_KUBECONFIG))),
        })
    }
}

/// Bootstraps one node according to its role
pub struct NodeBootstrap {
    cfg: BootstrapConfig,
    fs: HostFs,
    deps: Collaborators,
}

impl NodeBootstrap {
    /// Create a bootstrap run for `cfg`
    pub fn new(cfg: BootstrapConfig, deps: Collaborators) -> Self {
        let fs = HostFs::new(&cfg.host_root);
        Self { cfg, fs, deps }
    }

    /// The configuration this run uses
    pub fn config(&self) -> &BootstrapConfig {
        &self.cfg
    }

    /// Run the role's step sequence
    pub async fn run(&self) -> std::result::Result<BootstrapReport, BootstrapFailure> {
        let mut pipeline = Pipeline::new(self.cfg.role);
        info!(
            role = %self.cfg.role,
            cluster = %self.cfg.cluster.cluster_name,
            version = %self.cfg.cluster.kubernetes_version,
            "Starting node bootstrap"
        );

        let result = match self.cfg.role {
            NodeRole::ControlPlane => self.run_control_plane(&mut pipeline).await,
            NodeRole::Worker => self.run_worker(&mut pipeline).await,
        };

        match result {
            Ok(()) => {
                info!(role = %self.cfg.role, "Node bootstrap complete");
                Ok(pipeline.finish())
            }
            Err(e) => Err(pipeline.fail(e)),
        }
    }

    async fn prepare_node(&self, pipeline: &mut Pipeline) -> Result<NodeIdentity> {
        let runner = self.deps.runner.as_ref();

        let resolver = NodeIdentityResolver::new(self.deps.metadata.clone());
        let identity = pipeline
            .step(steps::RESOLVE_IDENTITY, resolver.resolve())
            .await?;
        pipeline.report_mut().identity = Some(identity.clone());

        let runtime = RuntimeInstaller::new(runner, &self.fs, &self.cfg.runtime);
        pipeline
            .step(steps::INSTALL_RUNTIME, runtime.install())
            .await?;

        let tooling = ToolingInstaller::new(
            runner,
            &self.fs,
            &self.cfg.tooling,
            self.cfg.cluster.kubernetes_version,
        );
        pipeline
            .step(steps::INSTALL_TOOLING, tooling.install())
            .await?;

        Ok(identity)
    }

    async fn run_control_plane(&self, pipeline: &mut Pipeline) -> Result<()> {
        let identity = self.prepare_node(pipeline).await?;
        let runner = self.deps.runner.as_ref();

        let initializer =
            ControlPlaneInitializer::new(runner, &self.fs, self.deps.probe.as_ref(), &self.cfg);
        let outcome = pipeline
            .step(
                steps::INITIALIZE_CONTROL_PLANE,
                initializer.initialize(&identity),
            )
            .await?;

        let provisioner = CredentialProvisioner::new(runner, &self.fs, &self.cfg);
        let kubeconfigs = pipeline
            .step(steps::PROVISION_ACCESS, provisioner.provision(&outcome.manifest))
            .await?;
        pipeline.report_mut().kubeconfigs = kubeconfigs;

        self.install_addons(pipeline).await
    }

    async fn install_addons(&self, pipeline: &mut Pipeline) -> Result<()> {
        let started = Instant::now();
        let installer = AddonInstaller::new(
            self.deps.runner.as_ref(),
            &self.fs,
            self.deps.fetcher.as_ref(),
            &self.cfg,
        );
        let reports = installer.install_all().await;
        let elapsed = started.elapsed();

        let failed: Vec<&AddonReport> = reports.iter().filter(|r| !r.succeeded()).collect();
        let result = match failed.first() {
            None => {
                pipeline.record(steps::INSTALL_ADDONS, StepOutcome::Succeeded, elapsed);
                Ok(())
            }
            Some(first) => {
                let message = format!(
                    "{} of {} addons failed: {}",
                    failed.len(),
                    reports.len(),
                    failed
                        .iter()
                        .map(|r| r.url.as_str())
                        .collect::<Vec<_>>()
                        .join(", ")
                );
                if self.cfg.addons_fatal {
                    pipeline.record(
                        steps::INSTALL_ADDONS,
                        StepOutcome::Failed(message.clone()),
                        elapsed,
                    );
                    Err(Error::addon(first.url.clone(), message))
                } else {
                    warn!(step = steps::INSTALL_ADDONS, %message, "Continuing with failed addons");
                    pipeline.record(steps::INSTALL_ADDONS, StepOutcome::Partial(message), elapsed);
                    Ok(())
                }
            }
        };
        pipeline.report_mut().addons = reports;
        result
    }

    async fn run_worker(&self, pipeline: &mut Pipeline) -> Result<()> {
        let identity = self.prepare_node(pipeline).await?;
        let joiner = NodeJoiner::new(self.deps.runner.as_ref(), &self.cfg);
        pipeline
            .step(steps::JOIN_CLUSTER, joiner.join(&identity))
            .await?;
        Ok(())
    }
}
