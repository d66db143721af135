//! Browser-kube runtime - image pulling and content extraction.
//!
//! Provides the container clients and the resolver that materializes an
//! image's merged filesystem to serve payload files to browser workers.

#![allow(clippy::result_large_err)]

pub mod oci;

use std::sync::Arc;

use browser_kube_core::{ImageSource, Result};

// Re-export common types
pub use oci::{ContainerClient, DockerCliClient, RegistryAuth, RegistryClient};
pub use oci::{ExtractedFiles, ImageContentResolver};

/// Browser-kube runtime version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build the container client for the configured image source.
///
/// Fails with `ClientInit` when the docker source is selected but no
/// `docker` binary is available.
pub fn container_client(source: ImageSource) -> Result<Arc<dyn ContainerClient>> {
    let client: Arc<dyn ContainerClient> = match source {
        ImageSource::Registry => Arc::new(RegistryClient::new(RegistryAuth::from_env())),
        ImageSource::Docker => Arc::new(DockerCliClient::locate("docker")?),
    };
    Ok(client)
}
