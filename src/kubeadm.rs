//! kubeadm invocations guarded by the bootstrap state machine
//!
//! `init` and `join` are only issued from [`BootstrapState::Uninitialized`];
//! callers must [`Kubeadm::reset`] first. The state check happens before the
//! process is spawned, so a sequencing bug fails loudly instead of letting
//! kubeadm trip over leftovers from an earlier run.

use std::path::Path;
use std::time::Duration;

use tracing::info;

use crate::exec::{run_checked, CommandOutput, CommandRunner, Invocation};
use crate::state::{BootstrapState, StateMachine, Transition};
use crate::{Error, Result};

/// Admin kubeconfig written by `kubeadm init`
pub const ADMIN_KUBECONFIG: &str = "/etc/kubernetes/admin.conf";

/// kubeadm CLI wrapper for one bootstrap run
pub struct Kubeadm<'a, R: CommandRunner + ?Sized> {
    runner: &'a R,
    cri_endpoint: String,
    state: StateMachine,
}

impl<'a, R: CommandRunner + ?Sized> Kubeadm<'a, R> {
    /// Create a wrapper; the host is assumed dirty until reset
    pub fn new(runner: &'a R, cri_endpoint: impl Into<String>) -> Self {
        Self {
            runner,
            cri_endpoint: cri_endpoint.into(),
            state: StateMachine::new(),
        }
    }

    /// Current host state
    pub fn state(&self) -> BootstrapState {
        self.state.state()
    }

    /// Transitions applied so far
    pub fn history(&self) -> &[Transition] {
        self.state.history()
    }

    /// `kubeadm reset -f`; safe on a host that was never initialized
    pub async fn reset(&mut self) -> Result<()> {
        run_checked(
            self.runner,
            Invocation::new("kubeadm").args([
                "reset",
                "-f",
                "--cri-socket",
                self.cri_endpoint.as_str(),
            ]),
        )
        .await?;
        self.state.transition(Transition::Reset)?;
        Ok(())
    }

    /// `kubeadm init --config <path> --upload-certs`, bounded by `timeout`
    ///
    /// A non-zero exit is [`Error::InitFailure`]; running out of time is
    /// [`Error::InitTimeout`]. Either way the host is left `Bootstrapped`.
    pub async fn init(&mut self, config: &Path, timeout: Duration) -> Result<CommandOutput> {
        self.state.transition(Transition::Initialize)?;

        let inv = Invocation::new("kubeadm")
            .args(["init", "--config"])
            .arg(config.display().to_string())
            .arg("--upload-certs");
        info!(command = %inv, timeout_secs = timeout.as_secs(), "Running kubeadm init");

        let output = tokio::time::timeout(timeout, self.runner.run(&inv))
            .await
            .map_err(|_| Error::InitTimeout(timeout))??;

        output.into_result(&inv).map_err(|e| match e {
            Error::Command { stderr, .. } => Error::InitFailure(stderr),
            other => other,
        })
    }

    /// `kubeadm join --config <path>`
    ///
    /// Returns the raw [`Error::Command`] on failure so the caller can
    /// classify the diagnostics as transient or a rejection.
    pub async fn join(&mut self, config: &Path) -> Result<CommandOutput> {
        self.state.transition(Transition::Join)?;
        let inv = Invocation::new("kubeadm")
            .args(["join", "--config"])
            .arg(config.display().to_string());
        info!(command = %inv, "Running kubeadm join");
        run_checked(self.runner, inv).await
    }

    /// Render a client kubeconfig for `client_name` against the cluster CA
    ///
    /// Does not touch the state machine; it only reads `/etc/kubernetes/pki`.
    pub async fn kubeconfig_user(&self, client_name: &str, config: &Path) -> Result<String> {
        let output = run_checked(
            self.runner,
            Invocation::new("kubeadm")
                .args(["kubeconfig", "user", "--client-name", client_name, "--config"])
                .arg(config.display().to_string()),
        )
        .await?;
        Ok(output.stdout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::fake::FakeRunner;

    const CRI: &str = "unix:///run/containerd/containerd.sock";

    #[tokio::test]
    async fn init_without_reset_never_reaches_kubeadm() {
        let runner = FakeRunner::new();
        let mut kubeadm = Kubeadm::new(&runner, CRI);

        let err = kubeadm
            .init(Path::new("/tmp/init.yaml"), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn reset_then_init_runs_both_commands() {
        let runner = FakeRunner::new();
        let mut kubeadm = Kubeadm::new(&runner, CRI);

        kubeadm.reset().await.unwrap();
        assert_eq!(kubeadm.state(), BootstrapState::Uninitialized);
        kubeadm
            .init(Path::new("/tmp/init.yaml"), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(kubeadm.state(), BootstrapState::Bootstrapped);

        assert_eq!(
            runner.calls(),
            vec![
                format!("kubeadm reset -f --cri-socket {}", CRI),
                "kubeadm init --config /tmp/init.yaml --upload-certs".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn init_failure_carries_kubeadm_diagnostics() {
        let runner = FakeRunner::new().fail(
            "kubeadm init",
            1,
            "[ERROR Port-6443]: Port 6443 is in use",
        );
        let mut kubeadm = Kubeadm::new(&runner, CRI);
        kubeadm.reset().await.unwrap();

        let err = kubeadm
            .init(Path::new("/tmp/init.yaml"), Duration::from_secs(5))
            .await
            .unwrap_err();
        match err {
            Error::InitFailure(msg) => assert!(msg.contains("Port 6443 is in use")),
            other => panic!("expected init failure, got {:?}", other),
        }
        // a failed init still needs a reset before the next attempt
        assert_eq!(kubeadm.state(), BootstrapState::Bootstrapped);
    }

    #[tokio::test(start_paused = true)]
    async fn init_that_hangs_times_out() {
        struct Hanging;

        #[async_trait::async_trait]
        impl CommandRunner for Hanging {
            async fn run(&self, inv: &Invocation) -> Result<CommandOutput> {
                if inv.args.first().map(String::as_str) == Some("init") {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                }
                Ok(CommandOutput::ok(""))
            }
        }

        let runner = Hanging;
        let mut kubeadm = Kubeadm::new(&runner, CRI);
        kubeadm.reset().await.unwrap();
        let err = kubeadm
            .init(Path::new("/tmp/init.yaml"), Duration::from_secs(300))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InitTimeout(d) if d == Duration::from_secs(300)));
    }

    #[tokio::test]
    async fn kubeconfig_user_returns_rendered_stdout() {
        let runner = FakeRunner::new().stdout("kubeadm kubeconfig user", "apiVersion: v1\n");
        let kubeadm = Kubeadm::new(&runner, CRI);
        let out = kubeadm
            .kubeconfig_user("kubernetes-admin-user", Path::new("/tmp/cluster.yaml"))
            .await
            .unwrap();
        assert_eq!(out, "apiVersion: v1\n");
        assert_eq!(
            runner.calls()[0],
            "kubeadm kubeconfig user --client-name kubernetes-admin-user --config /tmp/cluster.yaml"
        );
    }
}
