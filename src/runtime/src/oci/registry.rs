//! OCI registry client.
//!
//! Uses the `oci-distribution` crate to pull image manifests and blobs from
//! container registries (Docker Hub, GHCR, etc.) and re-packages them as a
//! `docker save` style archive for the resolver.

use std::io::{Seek, SeekFrom, Write};

use async_trait::async_trait;
use browser_kube_core::error::{NodeError, Result};
use dashmap::DashMap;
use oci_distribution::client::{ClientConfig, ClientProtocol};
use oci_distribution::manifest::ImageIndexEntry;
use oci_distribution::secrets::RegistryAuth as OciRegistryAuth;
use oci_distribution::{Client, Reference};
use sha2::{Digest, Sha256};

use super::client::{ContainerClient, SaveArchive};
use super::manifest::{ImageManifestEntry, MANIFEST_FILE};

/// Authentication credentials for a container registry.
#[derive(Debug, Clone)]
pub struct RegistryAuth {
    username: Option<String>,
    password: Option<String>,
}

impl RegistryAuth {
    /// Create anonymous authentication (no credentials).
    pub fn anonymous() -> Self {
        Self {
            username: None,
            password: None,
        }
    }

    /// Create basic authentication with username and password.
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: Some(username.into()),
            password: Some(password.into()),
        }
    }

    /// Create authentication from environment variables.
    ///
    /// Reads `REGISTRY_USERNAME` and `REGISTRY_PASSWORD`.
    /// Falls back to anonymous if either is unset.
    pub fn from_env() -> Self {
        let username = std::env::var("REGISTRY_USERNAME").ok();
        let password = std::env::var("REGISTRY_PASSWORD").ok();

        if username.is_some() && password.is_some() {
            Self { username, password }
        } else {
            Self::anonymous()
        }
    }

    fn to_oci_auth(&self) -> OciRegistryAuth {
        match (&self.username, &self.password) {
            (Some(u), Some(p)) => OciRegistryAuth::Basic(u.clone(), p.clone()),
            _ => OciRegistryAuth::Anonymous,
        }
    }
}

/// A pulled image held in memory until it is saved.
struct PulledImage {
    config_digest: String,
    config: Vec<u8>,
    /// `(digest, blob)` in manifest order.
    layers: Vec<(String, Vec<u8>)>,
}

/// Container client talking directly to OCI registries.
pub struct RegistryClient {
    client: Client,
    auth: RegistryAuth,
    pulled: DashMap<String, PulledImage>,
}

impl RegistryClient {
    /// Create a registry client with the given authentication.
    pub fn new(auth: RegistryAuth) -> Self {
        let config = ClientConfig {
            protocol: ClientProtocol::Https,
            platform_resolver: Some(Box::new(wasm_platform_resolver)),
            ..Default::default()
        };
        Self {
            client: Client::new(config),
            auth,
            pulled: DashMap::new(),
        }
    }

    fn parse_reference(reference: &str) -> Result<Reference> {
        reference
            .parse::<Reference>()
            .map_err(|e| NodeError::InvalidReference(format!("'{}': {}", reference, e)))
    }
}

#[async_trait]
impl ContainerClient for RegistryClient {
    async fn pull(&self, reference: &str) -> Result<()> {
        let oci_ref = Self::parse_reference(reference)?;
        let pull_err = |message: String| NodeError::ImagePull {
            reference: reference.to_string(),
            message,
        };

        tracing::info!(
            reference = %reference,
            registry = %oci_ref.resolve_registry(),
            "Pulling image from registry"
        );

        // Resolves multi-platform indexes through the platform resolver.
        let auth = self.auth.to_oci_auth();
        let (manifest, manifest_digest) = self
            .client
            .pull_image_manifest(&oci_ref, &auth)
            .await
            .map_err(|e| pull_err(format!("Failed to pull manifest: {}", e)))?;

        let mut config = Vec::new();
        self.client
            .pull_blob(&oci_ref, &manifest.config, &mut config)
            .await
            .map_err(|e| pull_err(format!("Failed to pull config blob: {}", e)))?;
        verify_digest(&manifest.config.digest, &config).map_err(pull_err)?;

        let mut layers = Vec::with_capacity(manifest.layers.len());
        for layer in &manifest.layers {
            tracing::debug!(digest = %layer.digest, size = layer.size, "Pulling layer");

            let mut data = Vec::new();
            self.client
                .pull_blob(&oci_ref, layer, &mut data)
                .await
                .map_err(|e| pull_err(format!("Failed to pull layer {}: {}", layer.digest, e)))?;
            verify_digest(&layer.digest, &data).map_err(pull_err)?;
            layers.push((layer.digest.clone(), data));
        }

        tracing::info!(
            reference = %reference,
            digest = %manifest_digest,
            layers = layers.len(),
            "Image pulled successfully"
        );

        self.pulled.insert(
            reference.to_string(),
            PulledImage {
                config_digest: manifest.config.digest.clone(),
                config,
                layers,
            },
        );
        Ok(())
    }

    async fn save(&self, reference: &str) -> Result<SaveArchive> {
        let (_, image) = self
            .pulled
            .remove(reference)
            .ok_or_else(|| NodeError::ImageSave {
                reference: reference.to_string(),
                message: "image has not been pulled".to_string(),
            })?;

        let name = reference.to_string();
        tokio::task::spawn_blocking(move || write_save_archive(&name, &image))
            .await
            .map_err(|e| NodeError::ImageSave {
                reference: reference.to_string(),
                message: format!("save task failed: {}", e),
            })?
    }
}

/// Lay out a pulled image as a `docker save` archive in a spooled temp file.
fn write_save_archive(reference: &str, image: &PulledImage) -> Result<SaveArchive> {
    let save_err = |message: String| NodeError::ImageSave {
        reference: reference.to_string(),
        message,
    };

    let config_name = format!("{}.json", digest_hex(&image.config_digest));
    let layer_names: Vec<String> = image
        .layers
        .iter()
        .map(|(digest, _)| format!("{}/layer.tar", digest_hex(digest)))
        .collect();
    let manifest = vec![ImageManifestEntry {
        config: Some(config_name.clone()),
        repo_tags: Some(vec![reference.to_string()]),
        layers: layer_names.clone(),
    }];
    let manifest_json = serde_json::to_vec(&manifest)?;

    let spool = tempfile::tempfile()
        .map_err(|e| save_err(format!("Failed to create spool file: {}", e)))?;
    let mut builder = tar::Builder::new(spool);

    let mut append = |name: &str, data: &[u8]| -> std::io::Result<()> {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        builder.append_data(&mut header, name, data)
    };

    append(MANIFEST_FILE, &manifest_json)
        .and_then(|_| append(&config_name, &image.config))
        .map_err(|e| save_err(format!("Failed to write archive: {}", e)))?;
    for (name, (_, data)) in layer_names.iter().zip(&image.layers) {
        append(name, data).map_err(|e| save_err(format!("Failed to write {}: {}", name, e)))?;
    }

    let mut spool = builder
        .into_inner()
        .map_err(|e| save_err(format!("Failed to finish archive: {}", e)))?;
    spool
        .flush()
        .and_then(|_| spool.seek(SeekFrom::Start(0)).map(|_| ()))
        .map_err(|e| save_err(format!("Failed to rewind archive: {}", e)))?;

    Ok(Box::new(spool))
}

fn digest_hex(digest: &str) -> &str {
    digest.split_once(':').map(|(_, hex)| hex).unwrap_or(digest)
}

/// Check a blob against its `sha256:` descriptor digest.
///
/// Digests using other algorithms are accepted unchecked.
fn verify_digest(expected: &str, data: &[u8]) -> std::result::Result<(), String> {
    let Some(expected_hex) = expected.strip_prefix("sha256:") else {
        return Ok(());
    };
    let actual = hex::encode(Sha256::digest(data));
    if actual.eq_ignore_ascii_case(expected_hex) {
        Ok(())
    } else {
        Err(format!(
            "Digest mismatch: expected {}, got sha256:{}",
            expected, actual
        ))
    }
}

/// Platform resolver for multi-platform images.
///
/// Browser payloads are WebAssembly, so a `wasi`/`wasm` variant wins when an
/// index publishes one; otherwise the linux image for the host architecture
/// is used (WASM bundled into a regular image), then the first entry.
fn wasm_platform_resolver(manifests: &[ImageIndexEntry]) -> Option<String> {
    let arch = match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        other => other,
    };

    let wasm = manifests.iter().find(|entry| {
        entry
            .platform
            .as_ref()
            .map_or(false, |p| p.os == "wasi" || p.architecture == "wasm")
    });
    let host = || {
        manifests.iter().find(|entry| {
            entry
                .platform
                .as_ref()
                .map_or(false, |p| p.os == "linux" && p.architecture == arch)
        })
    };

    wasm.or_else(host)
        .or_else(|| manifests.first())
        .map(|entry| entry.digest.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oci::manifest::read_manifest;
    use std::io::Read;
    use tempfile::TempDir;

    #[test]
    fn test_registry_auth_anonymous() {
        let auth = RegistryAuth::anonymous();
        assert!(matches!(auth.to_oci_auth(), OciRegistryAuth::Anonymous));
    }

    #[test]
    fn test_registry_auth_basic() {
        let auth = RegistryAuth::basic("user", "pass");
        assert_eq!(auth.username.as_deref(), Some("user"));
        assert!(matches!(auth.to_oci_auth(), OciRegistryAuth::Basic(_, _)));
    }

    #[test]
    fn test_parse_reference_normalizes_docker_hub() {
        let reference = RegistryClient::parse_reference("busybox").unwrap();
        assert_eq!(reference.repository(), "library/busybox");
    }

    #[test]
    fn test_parse_reference_invalid() {
        let err = RegistryClient::parse_reference("UPPER CASE!").unwrap_err();
        assert!(matches!(err, NodeError::InvalidReference(_)));
    }

    #[test]
    fn test_verify_digest() {
        let data = b"hello";
        let digest = format!("sha256:{}", hex::encode(Sha256::digest(data)));
        assert!(verify_digest(&digest, data).is_ok());
        assert!(verify_digest(&digest, b"other").is_err());
        assert!(verify_digest("sha512:abc", data).is_ok());
    }

    #[test]
    fn test_digest_hex() {
        assert_eq!(digest_hex("sha256:abc"), "abc");
        assert_eq!(digest_hex("abc"), "abc");
    }

    #[tokio::test]
    async fn test_save_without_pull_fails() {
        let client = RegistryClient::new(RegistryAuth::anonymous());
        let err = client.save("busybox").await.err().unwrap();
        assert!(matches!(err, NodeError::ImageSave { .. }));
    }

    #[test]
    fn test_save_archive_layout() {
        let image = PulledImage {
            config_digest: "sha256:cfg".to_string(),
            config: b"{}".to_vec(),
            layers: vec![
                ("sha256:l1".to_string(), b"layer-one".to_vec()),
                ("sha256:l2".to_string(), b"layer-two".to_vec()),
            ],
        };
        let mut archive = write_save_archive("hello:latest", &image).unwrap();
        let mut bytes = Vec::new();
        archive.read_to_end(&mut bytes).unwrap();

        let tmp = TempDir::new().unwrap();
        crate::oci::layers::unpack(bytes.as_slice(), tmp.path()).unwrap();

        let entries = read_manifest(tmp.path()).unwrap();
        assert_eq!(entries[0].layers, vec!["l1/layer.tar", "l2/layer.tar"]);
        assert_eq!(entries[0].config.as_deref(), Some("cfg.json"));
        assert_eq!(
            std::fs::read(tmp.path().join("l2/layer.tar")).unwrap(),
            b"layer-two"
        );
    }
}
