//! Worker join
//!
//! Workers boot at the same time as the control plane and have no signal
//! telling them when it is ready. The joiner simply keeps trying: reset,
//! join, and on a transient failure back off and go again until the
//! discovery deadline. Failures that no amount of waiting will fix (wrong
//! token, pinned CA mismatch, a node with the same name) stop the loop at
//! once.

use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::BootstrapConfig;
use crate::exec::CommandRunner;
use crate::identity::NodeIdentity;
use crate::kubeadm::Kubeadm;
use crate::manifest::{self, JoinManifest};
use crate::retry::{retry_until, RetryConfig, RetryFailure};
use crate::state::Transition;
use crate::{Error, Result};

/// kubeadm diagnostics that mean the control plane refused this node
const REJECTION_MARKERS: &[&str] = &[
    "could not find a jws signature",
    "failed to verify jws signature",
    "is invalid for this cluster",
    "unauthorized",
    "invalid bootstrap token",
    "already exists in the cluster",
    "are pinned",
    "does not match",
];

/// How a failed join attempt should be handled
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JoinFailureKind {
    /// Control plane not reachable or not ready yet; try again
    Transient,
    /// Control plane refused the node; needs an operator
    Rejected,
}

/// Classify kubeadm join diagnostics
pub fn classify_join_failure(diagnostics: &str) -> JoinFailureKind {
    let lower = diagnostics.to_ascii_lowercase();
    if REJECTION_MARKERS.iter().any(|m| lower.contains(m)) {
        JoinFailureKind::Rejected
    } else {
        JoinFailureKind::Transient
    }
}

/// Slack on top of kubeadm's own discovery timeout before an attempt is
/// abandoned
const ATTEMPT_GRACE: Duration = Duration::from_secs(30);

fn is_join_command(command: &str) -> bool {
    command.starts_with("kubeadm join")
}

fn is_transient(err: &Error) -> bool {
    match err {
        Error::Command { command, stderr, .. } => {
            is_join_command(command)
                && classify_join_failure(stderr) == JoinFailureKind::Transient
        }
        Error::JoinTimeout { .. } => true,
        _ => false,
    }
}

/// kubeadm wrapper plus the last diagnostics it printed
struct Attempts<'a, R: CommandRunner + ?Sized> {
    kubeadm: Kubeadm<'a, R>,
    last_stderr: Option<String>,
}

/// Result of a successful join
#[derive(Debug)]
pub struct JoinOutcome {
    /// Attempts made, including the successful one
    pub attempts: u32,
    /// kubeadm transitions applied during the run
    pub transitions: Vec<Transition>,
}

/// Joins this worker to the control plane
pub struct NodeJoiner<'a, R: CommandRunner + ?Sized> {
    runner: &'a R,
    cfg: &'a BootstrapConfig,
    retry: RetryConfig,
}

impl<'a, R: CommandRunner + ?Sized> NodeJoiner<'a, R> {
    /// Create a joiner with the default discovery backoff
    pub fn new(runner: &'a R, cfg: &'a BootstrapConfig) -> Self {
        Self {
            runner,
            cfg,
            retry: RetryConfig::control_plane_discovery(),
        }
    }

    /// Override the backoff between attempts
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Join the cluster, blocking until the control plane accepts the node
    pub async fn join(&self, identity: &NodeIdentity) -> Result<JoinOutcome> {
        let manifest = JoinManifest::render(self.cfg, identity)?;
        let config_file = manifest::write_temp("kubeadm-join-", &manifest.to_yaml()?)?;
        let timeout = self.cfg.join.discovery_timeout;

        if self.cfg.join.unsafe_skip_ca_verification {
            warn!(
                endpoint = %self.cfg.cluster.join_endpoint(),
                "Joining without CA verification: the control plane's identity is trusted on first use"
            );
        }
        info!(
            node = %identity.hostname,
            endpoint = %self.cfg.cluster.join_endpoint(),
            token_id = self.cfg.cluster.bootstrap_token.id(),
            timeout_secs = timeout.as_secs(),
            "Joining cluster"
        );

        let attempts = Mutex::new(Attempts {
            kubeadm: Kubeadm::new(self.runner, self.cfg.runtime.cri_endpoint()),
            last_stderr: None,
        });
        let path = config_file.path();
        let attempt_bound = self.cfg.join.kubeadm_discovery_timeout() + ATTEMPT_GRACE;

        // The deadline only gates starting an attempt; a started attempt runs
        // to kubeadm's own timeout so its diagnostics can be classified.
        let result = retry_until(&self.retry, timeout, "kubeadm-join", is_transient, |_| {
            let attempts = &attempts;
            async move {
                let mut attempts = attempts.lock().await;
                attempts.kubeadm.reset().await?;
                let attempt =
                    tokio::time::timeout(attempt_bound, attempts.kubeadm.join(path)).await;
                match attempt {
                    Ok(Ok(_)) => Ok(()),
                    Ok(Err(err)) => {
                        if let Error::Command { stderr, .. } = &err {
                            attempts.last_stderr = Some(stderr.clone());
                        }
                        Err(err)
                    }
                    Err(_) => Err(Error::JoinTimeout {
                        timeout: attempt_bound,
                        last_error: format!(
                            "kubeadm join did not return within {}s",
                            attempt_bound.as_secs()
                        ),
                    }),
                }
            }
        })
        .await;

        let attempts = attempts.into_inner();
        let transitions = attempts.kubeadm.history().to_vec();
        match result {
            Ok(()) => {
                let attempts = transitions
                    .iter()
                    .filter(|t| **t == Transition::Join)
                    .count() as u32;
                info!(node = %identity.hostname, attempts, "Node joined cluster");
                Ok(JoinOutcome {
                    attempts,
                    transitions,
                })
            }
            Err(RetryFailure::Permanent(Error::Command {
                command, stderr, ..
            })) if is_join_command(&command) => Err(Error::JoinRejected(stderr)),
            Err(RetryFailure::Permanent(other)) => Err(other),
            Err(RetryFailure::DeadlineExceeded { last, attempts: tried }) => {
                warn!(attempts = tried, "Control plane never accepted the join");
                let last_error = match last {
                    Error::Command { stderr, .. } => stderr,
                    Error::JoinTimeout { last_error, .. } => {
                        attempts.last_stderr.unwrap_or(last_error)
                    }
                    other => other.to_string(),
                };
                Err(Error::JoinTimeout {
                    timeout,
                    last_error,
                })
            }
        }
    }
}
