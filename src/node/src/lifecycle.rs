//! Callbacks a hosting framework drives a virtual node through.
//!
//! The control plane side (watching pods bound to this node, registering the
//! node object and renewing its lease) lives in the hosting framework; it
//! talks to the node exclusively through these two traits.

use async_trait::async_trait;
use browser_kube_core::{Node, PodRecord, PodStatus, Result};

/// Pod lifecycle as seen by the hosting framework.
///
/// Methods may be called concurrently from arbitrary tasks.
#[async_trait]
pub trait PodLifecycleHandler: Send + Sync {
    /// A pod was bound to this node.
    async fn create_pod(&self, pod: PodRecord) -> Result<()>;

    /// A pod bound to this node changed. Replaces the stored record.
    async fn update_pod(&self, pod: PodRecord) -> Result<()>;

    /// A pod left this node. May be called more than once for the same pod.
    async fn delete_pod(&self, pod: &PodRecord) -> Result<()>;

    /// Stored record, `None` if the pod is unknown.
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<PodRecord>>;

    /// Current status, `None` if the pod is unknown.
    async fn get_pod_status(&self, namespace: &str, name: &str) -> Result<Option<PodStatus>>;

    /// All pods on this node.
    async fn get_pods(&self) -> Result<Vec<PodRecord>>;
}

/// Node object maintenance.
#[async_trait]
pub trait NodeProvider: Send + Sync {
    /// Liveness check used to keep the node lease fresh.
    async fn ping(&self) -> Result<()>;

    /// Fill in capacity, conditions, addresses and labels of `node`.
    fn configure_node(&self, node: &mut Node);
}
