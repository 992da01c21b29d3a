//! kubestrap - Kubernetes cluster bootstrap for cloud virtual machines
//!
//! kubestrap takes a freshly booted VM from bare OS to cluster member. It is
//! run once per node by the provisioning layer: one control-plane node and
//! any number of workers that boot at the same time and find each other
//! only through a shared bootstrap token and the control plane's address.
//!
//! # Architecture
//!
//! Every node runs the same preparation steps and then diverges by role:
//! - Control plane: `kubeadm init`, pod network overlay, admin credentials,
//!   addons
//! - Worker: `kubeadm join`, retried until the control plane accepts it or
//!   the discovery window closes
//!
//! Every host mutation goes through [`exec::CommandRunner`] and every host
//! path through [`host::HostFs`], so the whole sequence runs in tests
//! against a scripted host.
//!
//! # Modules
//!
//! - [`config`] - Bootstrap configuration, loaded from YAML and environment
//! - [`identity`] - Node identity from cloud instance metadata
//! - [`runtime`] - Kernel settings and containerd
//! - [`tooling`] - kubelet, kubeadm and kubectl at a pinned version
//! - [`manifest`] - kubeadm init/join manifest rendering
//! - [`controlplane`] - Control-plane initialization
//! - [`join`] - Worker join with discovery deadline
//! - [`credentials`] - Cluster-admin binding and operator kubeconfigs
//! - [`addons`] - Remote manifest installation
//! - [`pipeline`] - Ordered step sequence with per-step reports
//! - [`state`] - kubeadm reset/init/join state machine
//! - [`probe`] - Node readiness through the Kubernetes API
//! - [`error`] - Error types

#![deny(missing_docs)]

use std::time::Duration;

pub mod addons;
pub mod config;
pub mod controlplane;
pub mod credentials;
pub mod error;
pub mod exec;
pub mod host;
pub mod identity;
pub mod join;
pub mod kubeadm;
pub mod kubectl;
pub mod manifest;
pub mod pipeline;
pub mod probe;
pub mod retry;
pub mod runtime;
pub mod state;
pub mod token;
pub mod tooling;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Default Configuration Constants
// =============================================================================
// Centralized so configuration defaults, manifests and test fixtures agree.

/// Default Kubernetes API server port
pub const DEFAULT_API_SERVER_PORT: u16 = 6443;

/// Default containerd CRI socket
pub const DEFAULT_CRI_SOCKET: &str = "/run/containerd/containerd.sock";

/// Default instance metadata endpoint (EC2 style)
pub const DEFAULT_METADATA_ENDPOINT: &str = "http://169.254.169.254/latest";

/// Default bound on `kubeadm init`
pub const DEFAULT_INIT_TIMEOUT: Duration = Duration::from_secs(300);

/// Default window a worker keeps trying to reach the control plane
pub const DEFAULT_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(300);

/// Default kubeadm discovery timeout for a single join attempt
pub const DEFAULT_JOIN_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(60);
