//! Host file system and package access
//!
//! All host paths used by the bootstrap steps are absolute (`/etc/...`).
//! [`HostFs`] resolves them under a configurable root so the same code runs
//! against `/` in production and a temporary directory in tests.

mod apt;

pub use apt::{pinned_package, Apt};

use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};

use tracing::debug;

use crate::Result;

/// File system rooted at a host directory
#[derive(Debug, Clone)]
pub struct HostFs {
    root: PathBuf,
}

impl HostFs {
    /// Create a file system rooted at `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The live host, rooted at `/`
    pub fn system() -> Self {
        Self::new("/")
    }

    /// The root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map an absolute host path to its location under the root
    pub fn resolve(&self, path: impl AsRef<Path>) -> PathBuf {
        let relative: PathBuf = path
            .as_ref()
            .components()
            .filter(|c| !matches!(c, Component::RootDir | Component::Prefix(_)))
            .collect();
        self.root.join(relative)
    }

    /// Create a directory and its parents
    pub async fn create_dir_all(&self, path: impl AsRef<Path>) -> Result<()> {
        tokio::fs::create_dir_all(self.resolve(path)).await?;
        Ok(())
    }

    /// Write a file, creating parent directories
    pub async fn write(&self, path: impl AsRef<Path>, contents: &str) -> Result<()> {
        let target = self.resolve(&path);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        debug!(path = %target.display(), bytes = contents.len(), "Writing host file");
        tokio::fs::write(&target, contents).await?;
        Ok(())
    }

    /// Write a file and restrict it to `mode`
    ///
    /// The file is created empty and restricted before the contents land,
    /// so the secret never sits on disk with default permissions.
    pub async fn write_with_mode(
        &self,
        path: impl AsRef<Path>,
        contents: &str,
        mode: u32,
    ) -> Result<()> {
        let target = self.resolve(&path);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        if !tokio::fs::try_exists(&target).await? {
            tokio::fs::write(&target, "").await?;
        }
        tokio::fs::set_permissions(&target, std::fs::Permissions::from_mode(mode)).await?;
        tokio::fs::write(&target, contents).await?;
        Ok(())
    }

    /// Read a file to a string
    pub async fn read_to_string(&self, path: impl AsRef<Path>) -> Result<String> {
        Ok(tokio::fs::read_to_string(self.resolve(path)).await?)
    }

    /// Read a file, returning `None` if it does not exist
    pub async fn read_optional(&self, path: impl AsRef<Path>) -> Result<Option<String>> {
        match tokio::fs::read_to_string(self.resolve(path)).await {
            Ok(s) => Ok(Some(s)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Whether the path exists
    pub async fn exists(&self, path: impl AsRef<Path>) -> bool {
        tokio::fs::try_exists(self.resolve(path))
            .await
            .unwrap_or(false)
    }

    /// Permission bits of the file (lower 12 bits of the mode)
    pub async fn mode(&self, path: impl AsRef<Path>) -> Result<u32> {
        let meta = tokio::fs::metadata(self.resolve(path)).await?;
        Ok(meta.permissions().mode() & 0o7777)
    }
}
