//! Container client capability consumed by the image content resolver.
//!
//! A client makes an image available locally (`pull`) and hands out its
//! save-archive: a tar stream laid out like the output of `docker save`,
//! with a top-level `manifest.json` and one archive per layer.

use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use browser_kube_core::error::{NodeError, Result};
use tokio::process::Command;

/// Tar stream of an image save-archive.
pub type SaveArchive = Box<dyn Read + Send>;

/// Pull and save capability of a container engine or registry.
#[async_trait]
pub trait ContainerClient: Send + Sync {
    /// Make `reference` available to [`ContainerClient::save`].
    ///
    /// May take a long time; dropping the returned future abandons the pull.
    async fn pull(&self, reference: &str) -> Result<()>;

    /// Produce the save-archive of a previously pulled image.
    async fn save(&self, reference: &str) -> Result<SaveArchive>;
}

/// Client backed by a local `docker` CLI.
#[derive(Debug)]
pub struct DockerCliClient {
    binary: PathBuf,
}

impl DockerCliClient {
    /// Use `docker` from `PATH`.
    pub fn new() -> Self {
        Self::with_binary("docker")
    }

    /// Use a specific docker-compatible binary (e.g. `podman`).
    pub fn with_binary(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Like [`DockerCliClient::with_binary`], but fails up front when the
    /// binary is neither an existing file nor found on `PATH`.
    pub fn locate(binary: impl Into<PathBuf>) -> Result<Self> {
        let binary = binary.into();
        let found = if binary.components().count() > 1 {
            binary.is_file()
        } else {
            std::env::var_os("PATH").map_or(false, |paths| {
                std::env::split_paths(&paths).any(|dir| dir.join(&binary).is_file())
            })
        };
        if !found {
            return Err(NodeError::ClientInit(format!(
                "container engine binary '{}' not found",
                binary.display()
            )));
        }
        Ok(Self::with_binary(binary))
    }
}

impl Default for DockerCliClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContainerClient for DockerCliClient {
    async fn pull(&self, reference: &str) -> Result<()> {
        tracing::info!(reference = %reference, "Pulling image with docker");

        let output = Command::new(&self.binary)
            .arg("pull")
            .arg(reference)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| NodeError::ImagePull {
                reference: reference.to_string(),
                message: format!("Failed to run {}: {}", self.binary.display(), e),
            })?;

        if !output.status.success() {
            return Err(NodeError::ImagePull {
                reference: reference.to_string(),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        tracing::debug!(
            reference = %reference,
            progress = %String::from_utf8_lossy(&output.stdout).trim(),
            "docker pull finished"
        );
        Ok(())
    }

    async fn save(&self, reference: &str) -> Result<SaveArchive> {
        let save_err = |message: String| NodeError::ImageSave {
            reference: reference.to_string(),
            message,
        };

        let spool = tempfile::tempfile()
            .map_err(|e| save_err(format!("Failed to create spool file: {}", e)))?;
        let stdout = spool
            .try_clone()
            .map_err(|e| save_err(format!("Failed to clone spool file: {}", e)))?;

        let output = Command::new(&self.binary)
            .arg("save")
            .arg(reference)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| save_err(format!("Failed to run {}: {}", self.binary.display(), e)))?;

        if !output.status.success() {
            return Err(save_err(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }

        let mut archive = spool;
        archive
            .seek(SeekFrom::Start(0))
            .map_err(|e| save_err(format!("Failed to rewind spool file: {}", e)))?;
        Ok(Box::new(archive))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_locate_missing_binary_is_client_init_error() {
        let err = DockerCliClient::locate("/nonexistent/browser-kube-docker").unwrap_err();
        assert!(matches!(err, NodeError::ClientInit(_)));
        assert_eq!(err.stage(), "client_init");

        let err = DockerCliClient::locate("browser-kube-no-such-engine").unwrap_err();
        assert!(matches!(err, NodeError::ClientInit(_)));
    }

    #[test]
    fn test_locate_existing_binary() {
        let binary = tempfile::NamedTempFile::new().unwrap();
        let client = DockerCliClient::locate(binary.path()).unwrap();
        assert_eq!(client.binary, binary.path());
    }

    #[tokio::test]
    async fn test_missing_binary_is_pull_error() {
        let client = DockerCliClient::with_binary("/nonexistent/browser-kube-docker");
        let err = client.pull("busybox").await.unwrap_err();
        assert!(matches!(err, NodeError::ImagePull { .. }));
        assert!(err.to_string().contains("busybox"));
    }

    #[tokio::test]
    async fn test_missing_binary_is_save_error() {
        let client = DockerCliClient::with_binary("/nonexistent/browser-kube-docker");
        let err = client.save("busybox").await.err().unwrap();
        assert!(matches!(err, NodeError::ImageSave { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failing_command_reports_stderr() {
        // `false` exits non-zero for any arguments.
        let client = DockerCliClient::with_binary("false");
        let err = client.pull("busybox").await.unwrap_err();
        assert!(matches!(err, NodeError::ImagePull { .. }));
    }
}
