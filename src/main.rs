//! kubestrap - bootstrap one cloud VM into a kubeadm cluster

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use kubestrap::config::{BootstrapConfig, ConfigSource, NodeRole};
use kubestrap::identity::{HttpMetadataClient, NodeIdentity, NodeIdentityResolver};
use kubestrap::kubeadm::ADMIN_KUBECONFIG;
use kubestrap::manifest::{InitManifest, JoinManifest};
use kubestrap::pipeline::{BootstrapReport, Collaborators, NodeBootstrap};
use kubestrap::probe::{ClusterProbe, KubeProbe};
use kubestrap::token::BootstrapToken;
use kubestrap::DEFAULT_METADATA_ENDPOINT;

/// kubestrap - take a fresh VM from bare OS to Kubernetes cluster member
#[derive(Parser, Debug)]
#[command(name = "kubestrap", version, about, long_about = None)]
struct Cli {
    /// Emit logs as JSON lines
    #[arg(long, global = true, env = "KUBESTRAP_LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Bootstrap this node as the cluster's control plane
    ///
    /// Installs containerd and the Kubernetes tooling, runs `kubeadm init`,
    /// applies the pod network overlay, writes operator kubeconfigs and
    /// installs the configured addons.
    ControlPlane(RunArgs),

    /// Bootstrap this node as a worker
    ///
    /// Installs containerd and the Kubernetes tooling, then keeps trying
    /// `kubeadm join` until the control plane accepts the node or the
    /// discovery timeout runs out.
    Worker(RunArgs),

    /// Bootstrap token operations
    #[command(subcommand)]
    Token(TokenCommand),

    /// Print this node's identity as read from instance metadata
    Identity {
        /// Instance metadata base URL
        #[arg(long, env = "KUBESTRAP_METADATA_ENDPOINT", default_value = DEFAULT_METADATA_ENDPOINT)]
        metadata_endpoint: String,
    },

    /// Print a kubeadm manifest without touching the host
    #[command(subcommand)]
    Render(RenderCommand),

    /// Summarize node readiness through a kubeconfig
    Status {
        /// Kubeconfig to use (defaults to the kubeadm admin kubeconfig)
        #[arg(long, env = "KUBECONFIG")]
        kubeconfig: Option<PathBuf>,
    },
}

#[derive(Subcommand, Debug)]
enum TokenCommand {
    /// Generate a new bootstrap token
    Generate,
}

#[derive(Subcommand, Debug)]
enum RenderCommand {
    /// Render the control plane's InitConfiguration bundle
    Init(RenderArgs),
    /// Render a worker's JoinConfiguration bundle
    Join(RenderArgs),
}

/// Arguments for the role subcommands
#[derive(Args, Debug)]
struct RunArgs {
    #[command(flatten)]
    config: ConfigArgs,

    /// Print the final report as JSON instead of a table
    #[arg(long)]
    report_json: bool,
}

/// Arguments for `render`
#[derive(Args, Debug)]
struct RenderArgs {
    #[command(flatten)]
    config: ConfigArgs,

    /// Local IP to render for instead of asking instance metadata
    #[arg(long, requires = "hostname")]
    local_ip: Option<IpAddr>,

    /// Hostname to render for instead of asking instance metadata
    #[arg(long, requires = "local_ip")]
    hostname: Option<String>,
}

/// Configuration values; each overrides the same key from `--config`
#[derive(Args, Debug, Default)]
struct ConfigArgs {
    /// YAML configuration file
    #[arg(long = "config", short = 'c', env = "KUBESTRAP_CONFIG")]
    config_file: Option<PathBuf>,

    /// Bootstrap token shared by every node
    #[arg(long, env = "KUBESTRAP_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Control plane private IP
    #[arg(long, env = "KUBESTRAP_CONTROL_PLANE_IP")]
    control_plane_ip: Option<String>,

    /// Control plane public IP
    #[arg(long, env = "KUBESTRAP_PUBLIC_IP")]
    public_ip: Option<String>,

    /// DNS name the API server is reachable at
    #[arg(long, env = "KUBESTRAP_DNS_NAME")]
    dns_name: Option<String>,

    /// Cluster name
    #[arg(long, env = "KUBESTRAP_CLUSTER_NAME")]
    cluster_name: Option<String>,

    /// Kubernetes version, fully pinned (e.g. 1.30.2)
    #[arg(long, env = "KUBESTRAP_K8S_VERSION")]
    kubernetes_version: Option<String>,

    /// Pod network range
    #[arg(long, env = "KUBESTRAP_POD_SUBNET")]
    pod_subnet: Option<String>,

    /// Service network range
    #[arg(long, env = "KUBESTRAP_SERVICE_SUBNET")]
    service_subnet: Option<String>,

    /// Addon manifest URLs, comma separated
    #[arg(long, env = "KUBESTRAP_ADDONS", value_delimiter = ',')]
    addons: Option<Vec<String>>,

    /// Cloud region, exposed to addon manifests as REGION
    #[arg(long, env = "KUBESTRAP_REGION")]
    region: Option<String>,

    /// Desired worker count, exposed to addon manifests as WORKER_COUNT
    #[arg(long, env = "KUBESTRAP_WORKER_COUNT")]
    worker_count: Option<u32>,

    /// Subnet IDs, comma separated, exposed to addon manifests as SUBNET_IDS
    #[arg(long, env = "KUBESTRAP_SUBNET_IDS", value_delimiter = ',')]
    subnet_ids: Option<Vec<String>>,

    /// Join without verifying the control plane's CA (trust on first use)
    #[arg(
        long,
        env = "KUBESTRAP_UNSAFE_SKIP_CA_VERIFICATION",
        num_args = 0..=1,
        default_missing_value = "true"
    )]
    unsafe_skip_ca_verification: Option<bool>,

    /// Pinned CA public key hashes (sha256:<hex>), comma separated
    #[arg(long, env = "KUBESTRAP_CA_CERT_HASHES", value_delimiter = ',')]
    ca_cert_hashes: Option<Vec<String>>,

    /// Instance metadata base URL
    #[arg(long, env = "KUBESTRAP_METADATA_ENDPOINT")]
    metadata_endpoint: Option<String>,

    /// Resolve host paths under this directory instead of /
    #[arg(long, env = "KUBESTRAP_HOST_ROOT")]
    host_root: Option<PathBuf>,
}

impl ConfigArgs {
    fn overrides(&self) -> ConfigSource {
        ConfigSource {
            bootstrap_token: self.token.clone(),
            control_plane_ip: self.control_plane_ip.clone(),
            public_ip: self.public_ip.clone(),
            dns_name: self.dns_name.clone(),
            cluster_name: self.cluster_name.clone(),
            kubernetes_version: self.kubernetes_version.clone(),
            pod_subnet: self.pod_subnet.clone(),
            service_subnet: self.service_subnet.clone(),
            addons: self.addons.clone(),
            region: self.region.clone(),
            worker_count: self.worker_count,
            subnet_ids: self.subnet_ids.clone(),
            unsafe_skip_ca_verification: self.unsafe_skip_ca_verification,
            ca_cert_hashes: self.ca_cert_hashes.clone(),
            metadata_endpoint: self.metadata_endpoint.clone(),
            host_root: self.host_root.clone(),
            ..ConfigSource::default()
        }
    }

    /// Layer flags and environment over the file and validate for `role`
    async fn load(&self, role: NodeRole) -> anyhow::Result<BootstrapConfig> {
        let base = match &self.config_file {
            Some(path) => {
                let content = tokio::fs::read_to_string(path)
                    .await
                    .with_context(|| format!("failed to read config file {}", path.display()))?;
                ConfigSource::from_yaml(&content)?
            }
            None => ConfigSource::default(),
        };
        Ok(base.merge(self.overrides()).build(role)?)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // kube and reqwest both pull in rustls; pick the provider explicitly so
    // neither falls over on an ambiguous default.
    if let Err(e) = rustls::crypto::ring::default_provider().install_default() {
        eprintln!("failed to install rustls crypto provider: {:?}", e);
        std::process::exit(1);
    }

    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Commands::ControlPlane(args) => run_bootstrap(NodeRole::ControlPlane, args).await,
        Commands::Worker(args) => run_bootstrap(NodeRole::Worker, args).await,
        Commands::Token(TokenCommand::Generate) => {
            println!("{}", BootstrapToken::generate().expose());
            Ok(())
        }
        Commands::Identity { metadata_endpoint } => {
            let identity = resolve_identity(&metadata_endpoint).await?;
            println!("{}", serde_json::to_string_pretty(&identity)?);
            Ok(())
        }
        Commands::Render(cmd) => run_render(cmd).await,
        Commands::Status { kubeconfig } => {
            let path = kubeconfig.unwrap_or_else(|| PathBuf::from(ADMIN_KUBECONFIG));
            let counts = KubeProbe::new(path).node_counts().await?;
            println!("{}", serde_json::to_string_pretty(&counts)?);
            Ok(())
        }
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    // stdout carries reports and rendered manifests
    if json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

async fn run_bootstrap(role: NodeRole, args: RunArgs) -> anyhow::Result<()> {
    let cfg = args.config.load(role).await?;
    let deps = Collaborators::host(&cfg)?;

    match NodeBootstrap::new(cfg, deps).run().await {
        Ok(report) => {
            print_report(&report, args.report_json)?;
            info!(role = %role, "Node bootstrap complete");
            Ok(())
        }
        Err(failure) => {
            print_report(&failure.report, args.report_json)?;
            Err(failure.into())
        }
    }
}

fn print_report(report: &BootstrapReport, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
    } else {
        print!("{}", report);
    }
    Ok(())
}

async fn resolve_identity(endpoint: &str) -> anyhow::Result<NodeIdentity> {
    let client = HttpMetadataClient::new(endpoint)?;
    Ok(NodeIdentityResolver::new(Arc::new(client)).resolve().await?)
}

async fn run_render(cmd: RenderCommand) -> anyhow::Result<()> {
    let (role, args) = match cmd {
        RenderCommand::Init(args) => (NodeRole::ControlPlane, args),
        RenderCommand::Join(args) => (NodeRole::Worker, args),
    };
    let cfg = args.config.load(role).await?;

    let identity = match (args.local_ip, &args.hostname) {
        (Some(ip), Some(hostname)) => NodeIdentity::new(ip, hostname),
        _ => resolve_identity(&cfg.metadata_endpoint).await?,
    };

    let yaml = match role {
        NodeRole::ControlPlane => InitManifest::render(&cfg, &identity)?.to_yaml()?,
        NodeRole::Worker => JoinManifest::render(&cfg, &identity)?.to_yaml()?,
    };
    print!("{}", yaml);
    Ok(())
}
