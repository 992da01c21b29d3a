//! Bootstrap configuration
//!
//! Everything the provisioning layer hands to a node arrives here, either
//! from a YAML file or from `KUBESTRAP_*` environment variables. The result
//! is one immutable [`BootstrapConfig`] passed by reference to every step,
//! so no component reads ambient process state.
//!
//! Control-plane and worker runs for the same cluster must be given the
//! same [`ClusterParameters`]; join credentials only match if they do.

use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::identity::normalize_dns_name;
use crate::token::BootstrapToken;
use crate::{
    Error, Result, DEFAULT_API_SERVER_PORT, DEFAULT_CRI_SOCKET, DEFAULT_DISCOVERY_TIMEOUT,
    DEFAULT_INIT_TIMEOUT, DEFAULT_JOIN_ATTEMPT_TIMEOUT, DEFAULT_METADATA_ENDPOINT,
};

/// Default pod network, matching the Calico manifest's default pool
pub const DEFAULT_POD_SUBNET: &str = "192.168.0.0/16";
/// Default service network, matching kubeadm's default
pub const DEFAULT_SERVICE_SUBNET: &str = "10.96.0.0/12";
/// Default pod network overlay manifest
pub const DEFAULT_OVERLAY_MANIFEST: &str =
    "https://raw.githubusercontent.com/projectcalico/calico/v3.27.3/manifests/calico.yaml";
/// Default upstream package repository for Kubernetes tooling
pub const DEFAULT_K8S_APT_REPOSITORY: &str = "https://pkgs.k8s.io/core:/stable:";

/// Which half of the cluster this node bootstraps into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeRole {
    /// The single control-plane node
    ControlPlane,
    /// A worker joining the control plane
    Worker,
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeRole::ControlPlane => write!(f, "control-plane"),
            NodeRole::Worker => write!(f, "worker"),
        }
    }
}

// =============================================================================
// Kubernetes version
// =============================================================================

/// A fully pinned Kubernetes version (`MAJOR.MINOR.PATCH`)
///
/// "latest" and partial versions are rejected so that the control plane and
/// every worker install exactly the same toolchain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct KubernetesVersion {
    /// Major version
    pub major: u32,
    /// Minor version
    pub minor: u32,
    /// Patch version
    pub patch: u32,
}

impl KubernetesVersion {
    /// Minor release series as used in the package repository path (`v1.30`)
    pub fn series(&self) -> String {
        format!("v{}.{}", self.major, self.minor)
    }

    /// Version tag as kubeadm expects it (`v1.30.2`)
    pub fn tag(&self) -> String {
        format!("v{}", self)
    }

    /// Whether kubeadm for this version speaks the v1beta4 config API
    pub fn uses_kubeadm_v1beta4(&self) -> bool {
        (self.major, self.minor) >= (1, 31)
    }
}

impl fmt::Display for KubernetesVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for KubernetesVersion {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || {
            Error::configuration(
                "kubernetesVersion",
                format!("'{}' is not a pinned MAJOR.MINOR.PATCH version", s),
            )
        };
        let trimmed = s.trim().trim_start_matches('v');
        let parts: Vec<&str> = trimmed.split('.').collect();
        if parts.len() != 3 {
            return Err(invalid());
        }
        let num = |p: &str| p.parse::<u32>().map_err(|_| invalid());
        Ok(Self {
            major: num(parts[0])?,
            minor: num(parts[1])?,
            patch: num(parts[2])?,
        })
    }
}

// =============================================================================
// CIDR
// =============================================================================

/// An IPv4 or IPv6 network in CIDR notation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cidr {
    addr: IpAddr,
    prefix: u8,
}

impl Cidr {
    /// Network address
    pub fn addr(&self) -> IpAddr {
        self.addr
    }

    /// Prefix length
    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    fn bits(addr: IpAddr) -> (u128, u8) {
        match addr {
            IpAddr::V4(v4) => (u32::from(v4) as u128, 32),
            IpAddr::V6(v6) => (u128::from(v6), 128),
        }
    }

    fn masked(value: u128, width: u8, prefix: u8) -> u128 {
        if prefix == 0 {
            return 0;
        }
        let host_bits = (width - prefix) as u32;
        (value >> host_bits) << host_bits
    }

    /// Whether the two networks share any address
    pub fn overlaps(&self, other: &Cidr) -> bool {
        let (a, width_a) = Self::bits(self.addr);
        let (b, width_b) = Self::bits(other.addr);
        if width_a != width_b {
            return false;
        }
        let prefix = self.prefix.min(other.prefix);
        Self::masked(a, width_a, prefix) == Self::masked(b, width_b, prefix)
    }

    /// Whether `ip` falls inside this network
    pub fn contains(&self, ip: IpAddr) -> bool {
        let (a, width_a) = Self::bits(self.addr);
        let (b, width_b) = Self::bits(ip);
        width_a == width_b
            && Self::masked(a, width_a, self.prefix) == Self::masked(b, width_b, self.prefix)
    }
}

impl fmt::Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix)
    }
}

impl FromStr for Cidr {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (addr, prefix) = s
            .trim()
            .split_once('/')
            .ok_or_else(|| format!("'{}' is missing a /prefix", s))?;
        let addr: IpAddr = addr
            .parse()
            .map_err(|_| format!("'{}' has an invalid address", s))?;
        let prefix: u8 = prefix
            .parse()
            .map_err(|_| format!("'{}' has an invalid prefix", s))?;
        let (value, width) = Self::bits(addr);
        if prefix > width {
            return Err(format!("'{}' prefix exceeds /{}", s, width));
        }
        if Self::masked(value, width, prefix) != value {
            return Err(format!("'{}' has host bits set", s));
        }
        Ok(Self { addr, prefix })
    }
}

// =============================================================================
// Cluster parameters and per-component settings
// =============================================================================

/// Cluster-wide parameters, identical on every node of the cluster
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterParameters {
    /// Shared bootstrap token
    pub bootstrap_token: BootstrapToken,
    /// Externally advertised DNS name, lowercased
    pub cluster_dns_name: String,
    /// Public IP of the API endpoint
    pub cluster_public_ip: IpAddr,
    /// Private IP workers use to reach the control plane
    pub control_plane_private_ip: IpAddr,
    /// API server port
    pub api_server_port: u16,
    /// Cluster name
    pub cluster_name: String,
    /// Pinned Kubernetes version
    pub kubernetes_version: KubernetesVersion,
    /// Pod network range
    pub pod_subnet: Cidr,
    /// Service network range
    pub service_subnet: Cidr,
}

impl ClusterParameters {
    /// `host:port` workers dial during discovery
    pub fn join_endpoint(&self) -> String {
        format_endpoint(&self.control_plane_private_ip.to_string(), self.api_server_port)
    }

    /// `dns:port` advertised as the control-plane endpoint
    pub fn control_plane_endpoint(&self) -> String {
        format!("{}:{}", self.cluster_dns_name, self.api_server_port)
    }

    /// Check cross-field invariants
    pub fn validate(&self) -> Result<()> {
        if self.pod_subnet.overlaps(&self.service_subnet) {
            return Err(Error::configuration(
                "podSubnet",
                format!(
                    "pod subnet {} overlaps service subnet {}",
                    self.pod_subnet, self.service_subnet
                ),
            ));
        }
        let networks = [
            ("podSubnet", &self.pod_subnet),
            ("serviceSubnet", &self.service_subnet),
        ];
        for (field, net) in networks {
            if net.contains(self.control_plane_private_ip) {
                return Err(Error::configuration(
                    field,
                    format!(
                        "{} contains the control plane address {}",
                        net, self.control_plane_private_ip
                    ),
                ));
            }
        }
        validate_cluster_name(&self.cluster_name)?;
        if self.cluster_dns_name.is_empty() {
            return Err(Error::configuration("dnsName", "must not be empty"));
        }
        Ok(())
    }
}

fn format_endpoint(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

fn validate_cluster_name(name: &str) -> Result<()> {
    let ok = !name.is_empty()
        && name.len() <= 63
        && name
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
        && !name.starts_with('-')
        && !name.ends_with('-');
    if ok {
        Ok(())
    } else {
        Err(Error::configuration(
            "clusterName",
            format!("'{}' is not a valid DNS-1123 label", name),
        ))
    }
}

/// Cgroup driver shared by the runtime and the kubelet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CgroupDriver {
    /// systemd-managed cgroups (kubeadm's default since 1.22)
    #[default]
    Systemd,
    /// Raw cgroupfs
    Cgroupfs,
}

impl CgroupDriver {
    /// Name used in kubelet configuration
    pub fn as_str(&self) -> &'static str {
        match self {
            CgroupDriver::Systemd => "systemd",
            CgroupDriver::Cgroupfs => "cgroupfs",
        }
    }
}

/// Container runtime settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeSettings {
    /// Package providing containerd
    pub package: String,
    /// Optional pinned package version
    pub version: Option<String>,
    /// Cgroup driver forced into the runtime config
    pub cgroup_driver: CgroupDriver,
    /// CRI socket path
    pub socket: String,
    /// How long to wait for the runtime socket after restart
    pub ready_timeout: Duration,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            package: "containerd".to_string(),
            version: None,
            cgroup_driver: CgroupDriver::Systemd,
            socket: DEFAULT_CRI_SOCKET.to_string(),
            ready_timeout: Duration::from_secs(60),
        }
    }
}

impl RuntimeSettings {
    /// CRI endpoint URI for kubeadm's `criSocket`
    pub fn cri_endpoint(&self) -> String {
        format!("unix://{}", self.socket)
    }
}

/// Tooling installer settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolingSettings {
    /// Base URL of the upstream apt repository
    pub apt_repository: String,
}

impl Default for ToolingSettings {
    fn default() -> Self {
        Self {
            apt_repository: DEFAULT_K8S_APT_REPOSITORY.to_string(),
        }
    }
}

/// Node registration details shared by init and join manifests
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationSettings {
    /// kubeadm image pull policy
    pub image_pull_policy: String,
    /// Value of the kubelet `cloud-provider` flag, omitted when `None`
    pub cloud_provider: Option<String>,
}

impl Default for RegistrationSettings {
    fn default() -> Self {
        Self {
            image_pull_policy: "IfNotPresent".to_string(),
            cloud_provider: None,
        }
    }
}

/// Control-plane initializer settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitSettings {
    /// Bound on `kubeadm init`
    pub init_timeout: Duration,
    /// Pod network overlay manifest
    pub overlay_manifest_url: String,
    /// Bound on waiting for the control-plane node to turn Ready
    pub ready_timeout: Duration,
    /// Remove the control-plane NoSchedule taint after init
    pub untaint_control_plane: bool,
}

impl Default for InitSettings {
    fn default() -> Self {
        Self {
            init_timeout: DEFAULT_INIT_TIMEOUT,
            overlay_manifest_url: DEFAULT_OVERLAY_MANIFEST.to_string(),
            ready_timeout: DEFAULT_INIT_TIMEOUT,
            untaint_control_plane: false,
        }
    }
}

/// Node joiner settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinSettings {
    /// How long a worker keeps trying to reach the control plane
    pub discovery_timeout: Duration,
    /// kubeadm's own discovery timeout for one join attempt
    pub attempt_timeout: Duration,
    /// Trust the control plane's CA on first contact without pinning
    pub unsafe_skip_ca_verification: bool,
    /// Pinned CA public key hashes (`sha256:<hex>`)
    pub ca_cert_hashes: Vec<String>,
}

impl Default for JoinSettings {
    fn default() -> Self {
        Self {
            discovery_timeout: DEFAULT_DISCOVERY_TIMEOUT,
            attempt_timeout: DEFAULT_JOIN_ATTEMPT_TIMEOUT,
            unsafe_skip_ca_verification: false,
            ca_cert_hashes: Vec::new(),
        }
    }
}

impl JoinSettings {
    /// Discovery timeout rendered into the join manifest
    ///
    /// Shorter than the discovery window so kubeadm gives up on an attempt,
    /// and prints why, while the joiner still has time to classify it.
    pub fn kubeadm_discovery_timeout(&self) -> Duration {
        self.attempt_timeout.min(self.discovery_timeout)
    }

    /// Reject a join configuration with no way to trust the control plane
    pub fn validate(&self) -> Result<()> {
        if self.unsafe_skip_ca_verification {
            return Ok(());
        }
        if self.ca_cert_hashes.is_empty() {
            return Err(Error::configuration(
                "caCertHashes",
                "at least one CA hash is required unless unsafeSkipCaVerification is set",
            ));
        }
        for hash in &self.ca_cert_hashes {
            let hex = hash.strip_prefix("sha256:").unwrap_or("");
            if hex.len() != 64 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
                return Err(Error::configuration(
                    "caCertHashes",
                    format!("'{}' is not a sha256:<64 hex> hash", hash),
                ));
            }
        }
        Ok(())
    }
}

/// Credential and access provisioner settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessSettings {
    /// Identity granted cluster-admin and embedded in the kubeconfigs
    pub admin_identity: String,
    /// Local user owning the kubeconfig files
    pub operational_user: String,
    /// Directory the kubeconfigs are written to
    pub home_dir: PathBuf,
    /// File name of the DNS-addressed kubeconfig
    pub dns_kubeconfig: String,
    /// File name of the IP-addressed kubeconfig
    pub ip_kubeconfig: String,
}

impl AccessSettings {
    /// Settings for `user` with default identity and file names
    pub fn for_user(user: &str) -> Self {
        Self {
            admin_identity: "kubernetes-admin-user".to_string(),
            operational_user: user.to_string(),
            home_dir: PathBuf::from(format!("/home/{}", user)),
            dns_kubeconfig: "kubeconfig-dns.yaml".to_string(),
            ip_kubeconfig: "kubeconfig-ip.yaml".to_string(),
        }
    }

    /// Name of the ClusterRoleBinding created for the admin identity
    pub fn binding_name(&self) -> String {
        format!("{}-cluster-admin", self.admin_identity)
    }
}

impl Default for AccessSettings {
    fn default() -> Self {
        Self::for_user("ubuntu")
    }
}

/// A remotely hosted manifest applied after initialization
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AddonDescriptor {
    /// Manifest URL
    pub url: String,
}

impl AddonDescriptor {
    /// Describe an addon at `url`
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

/// Complete, validated configuration for one node's bootstrap run
#[derive(Debug, Clone)]
pub struct BootstrapConfig {
    /// Role of this node
    pub role: NodeRole,
    /// Shared cluster parameters
    pub cluster: ClusterParameters,
    /// Container runtime settings
    pub runtime: RuntimeSettings,
    /// Tooling installer settings
    pub tooling: ToolingSettings,
    /// Node registration settings
    pub registration: RegistrationSettings,
    /// Control-plane initializer settings
    pub init: InitSettings,
    /// Node joiner settings
    pub join: JoinSettings,
    /// Credential provisioner settings
    pub access: AccessSettings,
    /// Addons in application order
    pub addons: Vec<AddonDescriptor>,
    /// Variables substituted into addon manifests
    pub addon_env: BTreeMap<String, String>,
    /// Abort the run when an addon fails
    pub addons_fatal: bool,
    /// Instance metadata base URL
    pub metadata_endpoint: String,
    /// Directory host paths are resolved under
    pub host_root: PathBuf,
}

// =============================================================================
// Raw configuration source
// =============================================================================

/// Unvalidated configuration as read from a file or the environment
///
/// Every field is optional so that a file and command-line/env values can be
/// layered with [`ConfigSource::merge`] before [`ConfigSource::build`]
/// checks that the required ones are present.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ConfigSource {
    /// Shared bootstrap token
    pub bootstrap_token: Option<String>,
    /// Control plane private IP
    pub control_plane_ip: Option<String>,
    /// Control plane public IP
    pub public_ip: Option<String>,
    /// Cluster DNS name
    pub dns_name: Option<String>,
    /// API server port
    pub api_server_port: Option<u16>,
    /// Cluster name
    pub cluster_name: Option<String>,
    /// Pinned Kubernetes version
    pub kubernetes_version: Option<String>,
    /// Pod network range
    pub pod_subnet: Option<String>,
    /// Service network range
    pub service_subnet: Option<String>,
    /// Cloud region, exposed to addons as `REGION`
    pub region: Option<String>,
    /// Desired worker count, exposed to addons as `WORKER_COUNT`
    pub worker_count: Option<u32>,
    /// Subnet IDs, exposed to addons as `SUBNET_IDS`
    pub subnet_ids: Option<Vec<String>>,
    /// Addon manifest URLs
    pub addons: Option<Vec<String>>,
    /// Extra addon substitution variables
    pub addon_env: Option<BTreeMap<String, String>>,
    /// Abort on addon failure
    pub addons_fatal: Option<bool>,
    /// Trust-on-first-use during join discovery
    pub unsafe_skip_ca_verification: Option<bool>,
    /// Pinned CA hashes for join discovery
    pub ca_cert_hashes: Option<Vec<String>>,
    /// Join discovery timeout in seconds
    pub discovery_timeout_secs: Option<u64>,
    /// kubeadm discovery timeout per join attempt in seconds
    pub join_attempt_timeout_secs: Option<u64>,
    /// kubeadm init timeout in seconds
    pub init_timeout_secs: Option<u64>,
    /// Pod network overlay manifest
    pub overlay_manifest_url: Option<String>,
    /// Remove the control-plane taint after init
    pub untaint_control_plane: Option<bool>,
    /// Kubelet cloud-provider flag value
    pub cloud_provider: Option<String>,
    /// Containerd package version pin
    pub runtime_version: Option<String>,
    /// Identity granted cluster-admin
    pub admin_identity: Option<String>,
    /// Local user owning the kubeconfigs
    pub operational_user: Option<String>,
    /// Instance metadata base URL
    pub metadata_endpoint: Option<String>,
    /// Directory host paths are resolved under
    pub host_root: Option<PathBuf>,
}

macro_rules! layer {
    ($base:ident, $over:ident, $($field:ident),+ $(,)?) => {
        ConfigSource {
            $($field: $over.$field.or($base.$field),)+
        }
    };
}

impl ConfigSource {
    /// Parse a YAML configuration file
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| Error::configuration("config file", e.to_string()))
    }

    /// Layer `overrides` on top of `self`; set fields in `overrides` win
    pub fn merge(self, overrides: ConfigSource) -> ConfigSource {
        let base = self;
        layer!(
            base,
            overrides,
            bootstrap_token,
            control_plane_ip,
            public_ip,
            dns_name,
            api_server_port,
            cluster_name,
            kubernetes_version,
            pod_subnet,
            service_subnet,
            region,
            worker_count,
            subnet_ids,
            addons,
            addon_env,
            addons_fatal,
            unsafe_skip_ca_verification,
            ca_cert_hashes,
            discovery_timeout_secs,
            join_attempt_timeout_secs,
            init_timeout_secs,
            overlay_manifest_url,
            untaint_control_plane,
            cloud_provider,
            runtime_version,
            admin_identity,
            operational_user,
            metadata_endpoint,
            host_root,
        )
    }

    /// Validate and build the configuration for a node of `role`
    pub fn build(self, role: NodeRole) -> Result<BootstrapConfig> {
        let token = BootstrapToken::parse(&required(self.bootstrap_token, "bootstrapToken")?)?;
        let dns_name = normalize_dns_name(&required(self.dns_name, "dnsName")?);
        let cluster_public_ip = parse_ip(required(self.public_ip, "publicIp")?, "publicIp")?;
        let control_plane_private_ip = parse_ip(
            required(self.control_plane_ip, "controlPlaneIp")?,
            "controlPlaneIp",
        )?;
        let cluster_name = required(self.cluster_name, "clusterName")?;
        let kubernetes_version: KubernetesVersion =
            required(self.kubernetes_version, "kubernetesVersion")?.parse()?;
        let region = required(self.region, "region")?;
        let worker_count = self
            .worker_count
            .ok_or_else(|| Error::configuration("workerCount", "required value is missing"))?;
        let subnet_ids = self
            .subnet_ids
            .ok_or_else(|| Error::configuration("subnetIds", "required value is missing"))?;
        let addon_urls = self
            .addons
            .ok_or_else(|| Error::configuration("addons", "required value is missing"))?;

        let pod_subnet = parse_cidr(
            self.pod_subnet.as_deref().unwrap_or(DEFAULT_POD_SUBNET),
            "podSubnet",
        )?;
        let service_subnet = parse_cidr(
            self.service_subnet
                .as_deref()
                .unwrap_or(DEFAULT_SERVICE_SUBNET),
            "serviceSubnet",
        )?;

        let cluster = ClusterParameters {
            bootstrap_token: token,
            cluster_dns_name: dns_name,
            cluster_public_ip,
            control_plane_private_ip,
            api_server_port: self.api_server_port.unwrap_or(DEFAULT_API_SERVER_PORT),
            cluster_name,
            kubernetes_version,
            pod_subnet,
            service_subnet,
        };
        cluster.validate()?;

        let join = JoinSettings {
            discovery_timeout: self
                .discovery_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_DISCOVERY_TIMEOUT),
            attempt_timeout: self
                .join_attempt_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_JOIN_ATTEMPT_TIMEOUT),
            unsafe_skip_ca_verification: self.unsafe_skip_ca_verification.unwrap_or(false),
            ca_cert_hashes: self.ca_cert_hashes.unwrap_or_default(),
        };
        if role == NodeRole::Worker {
            join.validate()?;
        }

        let mut init = InitSettings::default();
        if let Some(secs) = self.init_timeout_secs {
            init.init_timeout = Duration::from_secs(secs);
        }
        if let Some(url) = self.overlay_manifest_url {
            init.overlay_manifest_url = url;
        }
        init.untaint_control_plane = self.untaint_control_plane.unwrap_or(false);

        let mut access = AccessSettings::for_user(
            self.operational_user.as_deref().unwrap_or("ubuntu"),
        );
        if let Some(identity) = self.admin_identity {
            access.admin_identity = identity;
        }

        let runtime = RuntimeSettings {
            version: self.runtime_version,
            ..RuntimeSettings::default()
        };

        let registration = RegistrationSettings {
            cloud_provider: self.cloud_provider,
            ..RegistrationSettings::default()
        };

        let mut addon_env = self.addon_env.unwrap_or_default();
        addon_env
            .entry("CLUSTER_NAME".to_string())
            .or_insert_with(|| cluster.cluster_name.clone());
        addon_env
            .entry("CLUSTER_DNS_NAME".to_string())
            .or_insert_with(|| cluster.cluster_dns_name.clone());
        addon_env.entry("REGION".to_string()).or_insert(region);
        addon_env
            .entry("WORKER_COUNT".to_string())
            .or_insert_with(|| worker_count.to_string());
        addon_env
            .entry("SUBNET_IDS".to_string())
            .or_insert_with(|| subnet_ids.join(","));

        Ok(BootstrapConfig {
            role,
            cluster,
            runtime,
            tooling: ToolingSettings::default(),
            registration,
            init,
            join,
            access,
            addons: addon_urls
                .into_iter()
                .filter(|u| !u.trim().is_empty())
                .map(|u| AddonDescriptor::new(u.trim()))
                .collect(),
            addon_env,
            addons_fatal: self.addons_fatal.unwrap_or(false),
            metadata_endpoint: self
                .metadata_endpoint
                .unwrap_or_else(|| DEFAULT_METADATA_ENDPOINT.to_string()),
            host_root: self.host_root.unwrap_or_else(|| PathBuf::from("/")),
        })
    }
}

fn required(value: Option<String>, field: &str) -> Result<String> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v.trim().to_string()),
        _ => Err(Error::configuration(field, "required value is missing")),
    }
}

fn parse_ip(value: String, field: &str) -> Result<IpAddr> {
    value
        .parse()
        .map_err(|_| Error::configuration(field, format!("'{}' is not an IP address", value)))
}

fn parse_cidr(value: &str, field: &str) -> Result<Cidr> {
    value.parse().map_err(|e: String| Error::configuration(field, e))
}
