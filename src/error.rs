//! Error types for node bootstrap
//!
//! Each variant maps to one failure category of the bootstrap sequence.
//! The category decides whether the caller may retry the run as-is or needs
//! an operator to fix something first.

use std::time::Duration;

use thiserror::Error;

/// Main error type for bootstrap operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Instance metadata endpoint unreachable or returned garbage
    #[error("instance metadata unavailable: {0}")]
    MetadataUnavailable(String),

    /// Container runtime could not be installed or never became live
    #[error("container runtime install failed at {step}: {message}")]
    RuntimeInstallFailure {
        /// Sub-step that failed (e.g. "modprobe", "restart")
        step: String,
        /// Tool diagnostics
        message: String,
    },

    /// kubeadm/kubelet/kubectl installation failed
    #[error("kubernetes tooling install failed at {step}: {message}")]
    ToolingInstallFailure {
        /// Sub-step that failed (e.g. "apt-install", "swap")
        step: String,
        /// Tool diagnostics
        message: String,
    },

    /// Bad or missing configuration; needs an operator fix
    #[error("configuration error in {field}: {message}")]
    Configuration {
        /// Configuration field or manifest path at fault
        field: String,
        /// Description of what's invalid
        message: String,
    },

    /// `kubeadm init` exited non-zero
    #[error("cluster initialization failed: {0}")]
    InitFailure(String),

    /// Control plane did not become healthy in time
    #[error("control plane did not become healthy within {0:?}")]
    InitTimeout(Duration),

    /// Control plane unreachable for the whole discovery window
    #[error("join did not complete within {timeout:?}: {last_error}")]
    JoinTimeout {
        /// Discovery timeout that elapsed
        timeout: Duration,
        /// Diagnostics from the last attempt
        last_error: String,
    },

    /// Control plane refused the node (token or identity mismatch)
    #[error("join rejected by control plane: {0}")]
    JoinRejected(String),

    /// Role binding or kubeconfig rendering failed
    #[error("credential provisioning failed at {step}: {message}")]
    CredentialFailure {
        /// Sub-step that failed
        step: String,
        /// Tool diagnostics
        message: String,
    },

    /// A single addon manifest could not be fetched or applied
    #[error("addon {url} failed: {message}")]
    AddonApplyFailure {
        /// Manifest URL
        url: String,
        /// Description of what failed
        message: String,
    },

    /// kubeadm was asked to init or join a host that was not reset first
    #[error("cannot {transition} from state {from}; reset the node first")]
    InvalidTransition {
        /// State the node was in
        from: String,
        /// Rejected transition
        transition: String,
    },

    /// An external command exited non-zero
    #[error("command `{command}` failed ({status}): {stderr}")]
    Command {
        /// Rendered command line
        command: String,
        /// Exit status description
        status: String,
        /// Captured standard error
        stderr: String,
    },

    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// I/O error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Create a metadata error with the given message
    pub fn metadata(msg: impl Into<String>) -> Self {
        Self::MetadataUnavailable(msg.into())
    }

    /// Create a runtime install error for a sub-step
    pub fn runtime(step: impl Into<String>, msg: impl ToString) -> Self {
        Self::RuntimeInstallFailure {
            step: step.into(),
            message: msg.to_string(),
        }
    }

    /// Create a tooling install error for a sub-step
    pub fn tooling(step: impl Into<String>, msg: impl ToString) -> Self {
        Self::ToolingInstallFailure {
            step: step.into(),
            message: msg.to_string(),
        }
    }

    /// Create a configuration error for a field
    pub fn configuration(field: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Configuration {
            field: field.into(),
            message: msg.into(),
        }
    }

    /// Create a credential provisioning error for a sub-step
    pub fn credential(step: impl Into<String>, msg: impl ToString) -> Self {
        Self::CredentialFailure {
            step: step.into(),
            message: msg.to_string(),
        }
    }

    /// Create an addon failure for a manifest URL
    pub fn addon(url: impl Into<String>, msg: impl ToString) -> Self {
        Self::AddonApplyFailure {
            url: url.into(),
            message: msg.to_string(),
        }
    }

    /// Check if this error is retryable without operator intervention
    ///
    /// Only a join that timed out waiting for the control plane and a
    /// single failed addon are transient. Everything else leaves the node
    /// in a state a blind retry will not fix.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::JoinTimeout { .. } | Error::AddonApplyFailure { .. }
        )
    }

    /// Whether this error aborts the remaining bootstrap sequence
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Error::AddonApplyFailure { .. })
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
