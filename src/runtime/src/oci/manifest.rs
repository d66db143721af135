//! `manifest.json` of an image save-archive.
//!
//! The archive produced by `docker save` carries a top-level `manifest.json`
//! listing, per image, the relative paths of its layer archives in
//! application order:
//!
//! ```json
//! [{"Config": "<digest>.json", "RepoTags": ["hello:latest"], "Layers": ["<id>/layer.tar"]}]
//! ```

use std::path::Path;

use browser_kube_core::error::{NodeError, Result};
use serde::{Deserialize, Serialize};

/// File name of the manifest at the root of a save-archive.
pub const MANIFEST_FILE: &str = "manifest.json";

/// One image entry of a save-archive manifest.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageManifestEntry {
    #[serde(rename = "Config", alias = "config", default)]
    pub config: Option<String>,
    #[serde(rename = "RepoTags", alias = "repoTags", default)]
    pub repo_tags: Option<Vec<String>>,
    /// Layer archive paths relative to the archive root, bottom layer first.
    #[serde(rename = "Layers", alias = "layers", default)]
    pub layers: Vec<String>,
}

/// Parse manifest bytes into its entries.
///
/// An empty list is an error: an image always has at least one entry.
pub fn parse_manifest(data: &[u8]) -> Result<Vec<ImageManifestEntry>> {
    let entries: Vec<ImageManifestEntry> = serde_json::from_slice(data).map_err(|e| {
        NodeError::ManifestParse(format!(
            "Could not unmarshal {} in unpacked image: {}",
            MANIFEST_FILE, e
        ))
    })?;

    if entries.is_empty() {
        return Err(NodeError::ManifestParse(format!(
            "No manifests found in {}",
            MANIFEST_FILE
        )));
    }

    Ok(entries)
}

/// Read and parse `manifest.json` from an unpacked save-archive.
pub fn read_manifest(save_dir: &Path) -> Result<Vec<ImageManifestEntry>> {
    let path = save_dir.join(MANIFEST_FILE);
    let data = std::fs::read(&path).map_err(|e| {
        NodeError::ManifestRead(format!(
            "Could not find {} in unpacked image at {}: {}",
            MANIFEST_FILE,
            save_dir.display(),
            e
        ))
    })?;
    parse_manifest(&data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_docker_save_manifest() {
        let data = br#"[{
            "Config": "4f2a.json",
            "RepoTags": ["danielmschmidt/hello-wasm:latest"],
            "Layers": ["a1/layer.tar", "b2/layer.tar"]
        }]"#;
        let entries = parse_manifest(data).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].layers, vec!["a1/layer.tar", "b2/layer.tar"]);
        assert_eq!(entries[0].config.as_deref(), Some("4f2a.json"));
    }

    #[test]
    fn test_parse_lowercase_keys() {
        let entries = parse_manifest(br#"[{"layers": ["x/layer.tar"]}]"#).unwrap();
        assert_eq!(entries[0].layers, vec!["x/layer.tar"]);
    }

    #[test]
    fn test_empty_manifest_list_is_error() {
        let err = parse_manifest(b"[]").unwrap_err();
        assert!(matches!(err, NodeError::ManifestParse(_)));
        assert!(err.to_string().contains("No manifests found"));
    }

    #[test]
    fn test_malformed_manifest_is_error() {
        let err = parse_manifest(b"{not json").unwrap_err();
        assert!(matches!(err, NodeError::ManifestParse(_)));
    }

    #[test]
    fn test_missing_manifest_is_read_error() {
        let tmp = TempDir::new().unwrap();
        let err = read_manifest(tmp.path()).unwrap_err();
        assert!(matches!(err, NodeError::ManifestRead(_)));
    }

    #[test]
    fn test_read_manifest_from_dir() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(
            tmp.path().join(MANIFEST_FILE),
            r#"[{"Layers": ["l1.tar"]}]"#,
        )
        .unwrap();
        let entries = read_manifest(tmp.path()).unwrap();
        assert_eq!(entries[0].layers, vec!["l1.tar"]);
    }
}
