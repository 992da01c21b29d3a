//! kubectl invocations against the admin kubeconfig

use std::path::Path;

use crate::exec::{run_checked, CommandRunner, Invocation};
use crate::Result;

/// kubectl CLI wrapper bound to one kubeconfig
pub struct Kubectl<'a, R: CommandRunner + ?Sized> {
    runner: &'a R,
    kubeconfig: String,
}

impl<'a, R: CommandRunner + ?Sized> Kubectl<'a, R> {
    /// Create a wrapper that passes `--kubeconfig <kubeconfig>` to every call
    pub fn new(runner: &'a R, kubeconfig: impl Into<String>) -> Self {
        Self {
            runner,
            kubeconfig: kubeconfig.into(),
        }
    }

    fn base(&self) -> Invocation {
        Invocation::new("kubectl").args(["--kubeconfig", self.kubeconfig.as_str()])
    }

    /// `kubectl apply -f <url-or-path>`
    pub async fn apply_source(&self, source: &str) -> Result<String> {
        let out = run_checked(self.runner, self.base().args(["apply", "-f", source])).await?;
        Ok(out.stdout)
    }

    /// `kubectl apply -f <path>`
    pub async fn apply_file(&self, path: &Path) -> Result<String> {
        self.apply_source(&path.display().to_string()).await
    }

    /// `kubectl apply -f -` with the manifest on stdin
    pub async fn apply_stdin(&self, manifest: &str) -> Result<String> {
        let out = run_checked(
            self.runner,
            self.base().args(["apply", "-f", "-"]).stdin(manifest),
        )
        .await?;
        Ok(out.stdout)
    }

    /// Render `kubectl create <args>` client-side and apply the result
    ///
    /// `create` fails on an existing object; rendering with
    /// `--dry-run=client -o yaml` and piping into `apply` makes it idempotent.
    pub async fn create_or_apply(&self, create_args: &[&str]) -> Result<String> {
        let rendered = run_checked(
            self.runner,
            self.base()
                .arg("create")
                .args(create_args.iter().copied())
                .args(["--dry-run=client", "-o", "yaml"]),
        )
        .await?;
        self.apply_stdin(&rendered.stdout).await
    }

    /// Remove a taint from every node; a taint that is already gone is fine
    pub async fn remove_taint_all(&self, taint: &str) -> Result<()> {
        let inv = self
            .base()
            .args(["taint", "nodes", "--all"])
            .arg(format!("{}-", taint));
        let output = self.runner.run(&inv).await?;
        if output.success || output.stderr.contains("not found") {
            return Ok(());
        }
        output.into_result(&inv).map(|_| ())
    }
}
