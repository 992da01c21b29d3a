//! Debian/Ubuntu package manager wrapper

use crate::exec::{run_checked, CommandRunner, Invocation};
use crate::Result;

/// Thin wrapper over `apt-get` and `apt-mark`
pub struct Apt<'a, R: CommandRunner + ?Sized> {
    runner: &'a R,
}

impl<'a, R: CommandRunner + ?Sized> Apt<'a, R> {
    /// Create a wrapper over the given runner
    pub fn new(runner: &'a R) -> Self {
        Self { runner }
    }

    fn apt_get(&self) -> Invocation {
        Invocation::new("apt-get").env("DEBIAN_FRONTEND", "noninteractive")
    }

    /// Refresh package indexes
    pub async fn update(&self) -> Result<()> {
        run_checked(self.runner, self.apt_get().args(["update", "-q"])).await?;
        Ok(())
    }

    /// Install packages; already-installed packages are a no-op for apt
    ///
    /// Held packages may be changed so a re-run can move a pinned version.
    pub async fn install(&self, packages: &[String]) -> Result<()> {
        let inv = self
            .apt_get()
            .args([
                "install",
                "-y",
                "-q",
                "--allow-downgrades",
                "--allow-change-held-packages",
            ])
            .args(packages.iter().cloned());
        run_checked(self.runner, inv).await?;
        Ok(())
    }

    /// Pin packages against automatic upgrade; holding twice is fine
    pub async fn hold(&self, packages: &[&str]) -> Result<()> {
        run_checked(
            self.runner,
            Invocation::new("apt-mark")
                .arg("hold")
                .args(packages.iter().copied()),
        )
        .await?;
        Ok(())
    }

    /// Release holds so a pinned version can move
    pub async fn unhold(&self, packages: &[&str]) -> Result<()> {
        run_checked(
            self.runner,
            Invocation::new("apt-mark")
                .arg("unhold")
                .args(packages.iter().copied()),
        )
        .await?;
        Ok(())
    }
}

/// Apt pin `name=version-*` matching any Debian revision of `version`
pub fn pinned_package(name: &str, version: &str) -> String {
    format!("{}={}-*", name, version)
}
