use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{NodeError, Result};

/// Default node name registered with the cluster.
pub const DEFAULT_NODE_NAME: &str = "vkubelet-browser";

/// Default working directory for extracted image content.
pub const DEFAULT_IMAGE_BASE_PATH: &str = "/browser-kube-images";

/// Default directory for the browser execution environment's static assets.
pub const DEFAULT_STATIC_DIR: &str = "/browser-kube-files";

/// Files pulled out of every pod image and handed to the browser.
pub const DEFAULT_PAYLOAD_FILES: &[&str] = &["/wasm.js", "/wasm_bg.wasm"];

/// Where pod images are fetched from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ImageSource {
    /// Talk to the OCI registry directly.
    Registry,
    /// Shell out to a local `docker` CLI (`docker pull` / `docker save`).
    Docker,
}

impl Default for ImageSource {
    fn default() -> Self {
        Self::Registry
    }
}

impl std::fmt::Display for ImageSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Registry => write!(f, "registry"),
            Self::Docker => write!(f, "docker"),
        }
    }
}

impl std::str::FromStr for ImageSource {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "registry" => Ok(Self::Registry),
            "docker" => Ok(Self::Docker),
            _ => Err(format!(
                "unknown image source: '{}' (supported: registry, docker)",
                s
            )),
        }
    }
}

/// Virtual node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Port the browser-facing API listens on
    pub api_port: u16,

    /// Node name as seen by the cluster
    pub node_name: String,

    /// Operating system reported in the node info
    pub operating_system: String,

    /// Internal IP reported in the node addresses
    pub internal_ip: String,

    /// Kubelet daemon endpoint port
    pub daemon_port: u16,

    /// Base path holding `save/` and `content/` areas
    pub image_base_path: PathBuf,

    /// Static assets served on the fallback route
    pub static_dir: PathBuf,

    /// In-image file paths extracted for every pod
    pub payload_files: Vec<String>,

    /// Image fetch backend
    pub image_source: ImageSource,

    /// How long materialized image content is reused (0 = never)
    pub content_ttl_secs: u64,

    /// Optional directory of pod manifests acting as a local pod source
    pub pods_dir: Option<PathBuf>,

    /// Per-subscriber outbound queue depth
    pub subscriber_queue: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            api_port: 8080,
            node_name: DEFAULT_NODE_NAME.to_string(),
            operating_system: "linux".to_string(),
            internal_ip: "127.0.0.1".to_string(),
            daemon_port: 10250,
            image_base_path: PathBuf::from(DEFAULT_IMAGE_BASE_PATH),
            static_dir: PathBuf::from(DEFAULT_STATIC_DIR),
            payload_files: DEFAULT_PAYLOAD_FILES.iter().map(|s| s.to_string()).collect(),
            image_source: ImageSource::default(),
            content_ttl_secs: 0,
            pods_dir: None,
            subscriber_queue: 256,
        }
    }
}

impl NodeConfig {
    /// Check the configuration for values the node cannot start with.
    pub fn validate(&self) -> Result<()> {
        if self.api_port == 0 {
            return Err(NodeError::Config("api_port must be non-zero".to_string()));
        }
        if self.node_name.trim().is_empty() {
            return Err(NodeError::Config("node_name must not be empty".to_string()));
        }
        if self.payload_files.is_empty() {
            return Err(NodeError::Config(
                "at least one payload file is required".to_string(),
            ));
        }
        if let Some(bad) = self
            .payload_files
            .iter()
            .find(|p| p.split('/').any(|c| c == ".."))
        {
            return Err(NodeError::Config(format!(
                "payload file {:?} escapes the image root",
                bad
            )));
        }
        if self.subscriber_queue == 0 {
            return Err(NodeError::Config(
                "subscriber_queue must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Materialized-content reuse window.
    pub fn content_ttl(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.content_ttl_secs)
    }
}
