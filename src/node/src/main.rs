//! browser-kube - virtual Kubernetes node serving pods to browsers.
//!
//! Serves the browser API (pod list, payload files, WebSocket events and
//! static assets) and optionally feeds pods from a local manifest directory.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use browser_kube_core::config::{DEFAULT_IMAGE_BASE_PATH, DEFAULT_NODE_NAME, DEFAULT_STATIC_DIR};
use browser_kube_core::{ImageSource, Node, NodeConfig};
use browser_kube_node::{BrowserProvider, Gateway, NodeProvider, StaticPodSource};

/// Interval between node status refreshes.
const NODE_STATUS_INTERVAL: Duration = Duration::from_secs(30);

/// browser-kube virtual node
#[derive(Parser, Debug)]
#[command(name = "browser-kube", version, about = "Virtual Kubernetes node running pods in browsers")]
struct Args {
    /// Port the browser API listens on.
    #[arg(long, env = "API_PORT")]
    api_port: u16,

    /// Node name as registered in the cluster.
    #[arg(long, env = "VKUBELET_NODE_NAME", default_value = DEFAULT_NODE_NAME)]
    node_name: String,

    /// Operating system reported for the node.
    #[arg(long = "os", default_value = "linux")]
    operating_system: String,

    /// Internal IP reported for the node.
    #[arg(long, env = "VKUBELET_POD_IP", default_value = "127.0.0.1")]
    internal_ip: String,

    /// Kubelet daemon endpoint port.
    #[arg(long, env = "KUBELET_PORT", default_value_t = 10250)]
    kubelet_port: u16,

    /// Directory for pulled image content.
    #[arg(long, default_value = DEFAULT_IMAGE_BASE_PATH)]
    image_dir: String,

    /// Directory of static browser assets.
    #[arg(long, default_value = DEFAULT_STATIC_DIR)]
    static_dir: String,

    /// In-image file served to browsers (repeatable). Defaults to the
    /// wasm-bindgen pair `/wasm.js` and `/wasm_bg.wasm`.
    #[arg(long = "payload-file")]
    payload_files: Vec<String>,

    /// Where images come from: `registry` or `docker`.
    #[arg(long, default_value = "registry")]
    image_source: ImageSource,

    /// Seconds to reuse extracted image content (0 extracts on every request).
    #[arg(long, default_value_t = 0)]
    content_ttl: u64,

    /// Directory of pod manifests to run without a control plane.
    #[arg(long)]
    pods_dir: Option<String>,
}

/// Expand a leading `~` to the home directory.
fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix('~') {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        home.join(rest.trim_start_matches('/'))
    } else {
        PathBuf::from(path)
    }
}

impl Args {
    fn into_config(self) -> NodeConfig {
        let defaults = NodeConfig::default();
        NodeConfig {
            api_port: self.api_port,
            node_name: self.node_name,
            operating_system: self.operating_system,
            internal_ip: self.internal_ip,
            daemon_port: self.kubelet_port,
            image_base_path: expand_home(&self.image_dir),
            static_dir: expand_home(&self.static_dir),
            payload_files: if self.payload_files.is_empty() {
                defaults.payload_files
            } else {
                self.payload_files
            },
            image_source: self.image_source,
            content_ttl_secs: self.content_ttl,
            pods_dir: self.pods_dir.as_deref().map(expand_home),
            subscriber_queue: defaults.subscriber_queue,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Args::parse().into_config();
    if let Err(e) = run(config).await {
        tracing::error!(error = %e, "browser-kube failed");
        std::process::exit(1);
    }
    Ok(())
}

async fn run(config: NodeConfig) -> browser_kube_core::Result<()> {
    config.validate()?;

    tracing::info!(
        node = %config.node_name,
        api_port = config.api_port,
        image_dir = %config.image_base_path.display(),
        static_dir = %config.static_dir.display(),
        image_source = %config.image_source,
        content_ttl_secs = config.content_ttl_secs,
        "Starting browser-kube node"
    );

    let client = browser_kube_runtime::container_client(config.image_source)?;
    let addr = SocketAddr::from(([0, 0, 0, 0], config.api_port));
    let ttl = config.content_ttl();
    let pods_dir = config.pods_dir.clone();
    let provider = Arc::new(BrowserProvider::new(config, client)?);
    let shutdown = CancellationToken::new();

    // Stop on Ctrl+C
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutting down");
        }
        signal_token.cancel();
    });

    if !ttl.is_zero() {
        tokio::spawn(evict_content(provider.clone(), ttl, shutdown.clone()));
    }

    if let Some(dir) = pods_dir {
        let source = StaticPodSource::new(dir, provider.clone());
        let token = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = source.run(token).await {
                tracing::error!(error = %e, "Static pod source stopped");
            }
        });
    }

    tokio::spawn(report_node_status(provider.clone(), shutdown.clone()));

    Gateway::new(provider, shutdown).serve(addr).await
}

/// Periodically drop image content whose TTL elapsed.
async fn evict_content(provider: Arc<BrowserProvider>, ttl: Duration, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(ttl.max(Duration::from_secs(1)));
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {
                if let Err(e) = provider.evict_content().await {
                    tracing::warn!(error = %e, "Content eviction failed");
                }
            }
        }
    }
}

/// Keep the node object current, standing in for the control plane's lease loop.
async fn report_node_status(provider: Arc<BrowserProvider>, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(NODE_STATUS_INTERVAL);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {
                let mut node = Node::named(&provider.config().node_name);
                provider.configure_node(&mut node);
                match provider.ping().await {
                    Ok(()) => tracing::debug!(
                        node = %node.metadata.name,
                        pods = provider.registry().len(),
                        subscribers = provider.subscriber_count(),
                        conditions = node.status.conditions.len(),
                        "Node status"
                    ),
                    Err(e) => tracing::warn!(node = %node.metadata.name, error = %e, "Node not ready"),
                }
            }
        }
    }
}
