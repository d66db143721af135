//! Browser-backed virtual node provider.
//!
//! Owns the pod registry and the subscriber hub. Every registry mutation and
//! its broadcast happen under one ordering lock, as does taking the snapshot
//! for a new subscriber, so a subscriber sees each pod's events in the order
//! they were applied and never misses a delta between snapshot and register.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use browser_kube_core::node::{NodeAddress, NodeCondition, ResourceList};
use browser_kube_core::pod::{ContainerStatus, PodCondition};
use browser_kube_core::{BroadcastEvent, Node, NodeConfig, NodeError, PodKey, PodRecord, PodStatus, Result};
use browser_kube_runtime::{ContainerClient, ExtractedFiles, ImageContentResolver};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::hub::{BroadcastHub, SubscriberHandle, SubscriberId};
use crate::lifecycle::{NodeProvider, PodLifecycleHandler};
use crate::metrics::NodeMetrics;
use crate::registry::PodRegistry;

/// Label keeping service load balancers away from the virtual node.
pub const EXCLUDE_BALANCER_LABEL: &str = "alpha.service-controller.kubernetes.io/exclude-balancer";

/// Virtual node whose pods run in connected browsers.
pub struct BrowserProvider {
    config: NodeConfig,
    registry: PodRegistry,
    hub: BroadcastHub,
    /// Serializes registry mutation + broadcast and snapshot + register.
    ordering: Mutex<()>,
    resolver: ImageContentResolver,
    metrics: NodeMetrics,
    serving: AtomicBool,
    started_at: DateTime<Utc>,
}

impl BrowserProvider {
    pub fn new(config: NodeConfig, client: Arc<dyn ContainerClient>) -> Result<Self> {
        config.validate()?;
        let resolver = ImageContentResolver::new(&config.image_base_path, client, config.content_ttl());
        Ok(Self {
            hub: BroadcastHub::new(config.subscriber_queue),
            registry: PodRegistry::new(),
            ordering: Mutex::new(()),
            resolver,
            metrics: NodeMetrics::new()?,
            serving: AtomicBool::new(false),
            started_at: Utc::now(),
            config,
        })
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn registry(&self) -> &PodRegistry {
        &self.registry
    }

    pub fn metrics(&self) -> &NodeMetrics {
        &self.metrics
    }

    pub fn subscriber_count(&self) -> usize {
        self.hub.len()
    }

    /// Mark whether the gateway is accepting connections.
    pub fn set_serving(&self, serving: bool) {
        self.serving.store(serving, Ordering::SeqCst);
    }

    /// Register a browser connection. Its first frame is the current pod set.
    pub fn subscribe(&self, peer: impl Into<String>) -> Result<SubscriberHandle> {
        let handle = {
            let _order = self.ordering.lock();
            let snapshot = BroadcastEvent::Snapshot(self.registry.list());
            self.hub.register(peer, &snapshot)?
        };
        self.metrics.subscribers.set(self.hub.len() as i64);
        Ok(handle)
    }

    pub fn unsubscribe(&self, id: &SubscriberId) {
        if self.hub.unregister(id) {
            self.metrics.subscribers.set(self.hub.len() as i64);
        }
    }

    /// Store `pod` and tell every browser about it.
    fn schedule(&self, pod: PodRecord) -> Result<()> {
        let _order = self.ordering.lock();
        self.registry.put(pod.key(), pod.clone());
        self.metrics.pods.set(self.registry.len() as i64);
        self.publish(&BroadcastEvent::PodScheduled(pod))
    }

    /// Forget the pod under `key`, announcing the removal if it was known.
    fn unschedule(&self, key: PodKey) -> Result<bool> {
        let _order = self.ordering.lock();
        if self.registry.delete(&key).is_none() {
            return Ok(false);
        }
        self.metrics.pods.set(self.registry.len() as i64);
        self.publish(&BroadcastEvent::PodDeleted(key))?;
        Ok(true)
    }

    fn publish(&self, event: &BroadcastEvent) -> Result<()> {
        let delivery = self.hub.broadcast(event)?;
        self.metrics.broadcasts.inc();
        if delivery.failed > 0 {
            self.metrics.delivery_failures.inc_by(delivery.failed as u64);
            self.metrics.subscribers.set(self.hub.len() as i64);
        }
        Ok(())
    }

    /// Extract the node's payload files from the first container image of `pod`.
    pub async fn resolve_pod_files(&self, pod: &PodRecord, cancel: &CancellationToken) -> Result<ExtractedFiles> {
        let result = match pod.first_image() {
            Some(image) => {
                tracing::info!(pod = %pod.key(), image = %image, "Resolving payload files");
                self.resolver
                    .resolve(image, &self.config.payload_files, cancel)
                    .await
            }
            None => Err(NodeError::InvalidReference(format!(
                "pod {} has no container image",
                pod.key()
            ))),
        };
        self.metrics.record_resolve(&result);
        result
    }

    /// Drop materialized image content whose TTL elapsed.
    pub async fn evict_content(&self) -> Result<Vec<String>> {
        self.resolver.evict_expired().await
    }

    /// Status reported for a pod placed on this node.
    fn running_status(&self, pod: &PodRecord) -> PodStatus {
        let now = Utc::now().to_rfc3339();
        let started = pod
            .metadata
            .creation_timestamp
            .clone()
            .unwrap_or_else(|| self.started_at.to_rfc3339());
        let mut status = pod.status.clone().unwrap_or_default();

        status.phase = Some("Running".to_string());
        status.host_ip = Some(self.config.internal_ip.clone());
        status.pod_ip = Some(self.config.internal_ip.clone());
        status.start_time = Some(started.clone());
        status.conditions = ["Initialized", "Ready", "PodScheduled"]
            .iter()
            .map(|kind| PodCondition {
                kind: kind.to_string(),
                status: "True".to_string(),
                last_transition_time: Some(now.clone()),
                ..Default::default()
            })
            .collect();
        status.container_statuses = pod
            .spec
            .containers
            .iter()
            .map(|container| ContainerStatus {
                name: container.name.clone(),
                image: container.image.clone(),
                ready: true,
                restart_count: 0,
                state: Some(serde_json::json!({ "running": { "startedAt": started } })),
                ..Default::default()
            })
            .collect();
        status
    }
}

#[async_trait]
impl PodLifecycleHandler for BrowserProvider {
    async fn create_pod(&self, pod: PodRecord) -> Result<()> {
        tracing::info!(pod = %pod.key(), image = ?pod.first_image(), "Creating pod");
        self.schedule(pod)
    }

    async fn update_pod(&self, pod: PodRecord) -> Result<()> {
        tracing::info!(pod = %pod.key(), image = ?pod.first_image(), "Updating pod");
        self.schedule(pod)
    }

    async fn delete_pod(&self, pod: &PodRecord) -> Result<()> {
        let key = pod.key();
        if self.unschedule(key.clone())? {
            tracing::info!(pod = %key, "Deleted pod");
        } else {
            tracing::debug!(pod = %key, "Delete of unknown pod ignored");
        }
        Ok(())
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<PodRecord>> {
        Ok(self.registry.get(&PodKey::new(namespace, name)))
    }

    async fn get_pod_status(&self, namespace: &str, name: &str) -> Result<Option<PodStatus>> {
        Ok(self
            .registry
            .get(&PodKey::new(namespace, name))
            .map(|pod| self.running_status(&pod)))
    }

    async fn get_pods(&self) -> Result<Vec<PodRecord>> {
        Ok(self.registry.list())
    }
}

#[async_trait]
impl NodeProvider for BrowserProvider {
    async fn ping(&self) -> Result<()> {
        if self.serving.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(NodeError::Server("gateway is not serving".to_string()))
        }
    }

    fn configure_node(&self, node: &mut Node) {
        tracing::info!(node = %self.config.node_name, "Configuring node");

        let capacity: ResourceList = [("cpu", "10000"), ("memory", "4Ti"), ("pods", "5000")]
            .into_iter()
            .map(|(name, quantity)| (name.to_string(), quantity.to_string()))
            .collect();
        let now = Utc::now();
        let condition = |kind: &str, status: &str, reason: &str, message: &str| NodeCondition {
            kind: kind.to_string(),
            status: status.to_string(),
            last_heartbeat_time: now,
            last_transition_time: now,
            reason: reason.to_string(),
            message: message.to_string(),
        };

        node.metadata.name = self.config.node_name.clone();
        node.status.capacity = capacity.clone();
        node.status.allocatable = capacity;
        node.status.conditions = vec![
            condition("Ready", "True", "KubeletReady", "kubelet is ready."),
            condition(
                "OutOfDisk",
                "False",
                "KubeletHasSufficientDisk",
                "kubelet has sufficient disk space available",
            ),
            condition(
                "MemoryPressure",
                "False",
                "KubeletHasSufficientMemory",
                "kubelet has sufficient memory available",
            ),
            condition(
                "DiskPressure",
                "False",
                "KubeletHasNoDiskPressure",
                "kubelet has no disk pressure",
            ),
            condition(
                "NetworkUnavailable",
                "False",
                "RouteCreated",
                "RouteController created a route",
            ),
        ];
        node.status.addresses = vec![NodeAddress {
            kind: "InternalIP".to_string(),
            address: self.config.internal_ip.clone(),
        }];
        node.status.kubelet_port = self.config.daemon_port;
        node.status.node_info.operating_system = self.config.operating_system.clone();
        node.status.node_info.architecture = "wasm32".to_string();
        node.status.node_info.kubelet_version = format!("browser-kube-{}", crate::VERSION);
        node.metadata
            .labels
            .insert(EXCLUDE_BALANCER_LABEL.to_string(), "true".to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{test_config, FakeClient};
    use tempfile::TempDir;

    fn provider(tmp: &TempDir) -> BrowserProvider {
        BrowserProvider::new(test_config(tmp.path()), Arc::new(FakeClient::default())).unwrap()
    }

    fn frame(handle: &mut SubscriberHandle) -> serde_json::Value {
        serde_json::from_str(&handle.frames.try_recv().unwrap()).unwrap()
    }

    fn names(frame: &serde_json::Value) -> Vec<String> {
        frame["data"]
            .as_array()
            .unwrap()
            .iter()
            .map(|pod| pod["metadata"]["name"].as_str().unwrap().to_string())
            .collect()
    }

    #[tokio::test]
    async fn test_scheduling_scenario() {
        let tmp = TempDir::new().unwrap();
        let provider = provider(&tmp);
        let rec_a = PodRecord::new("default", "a", &["img-a"]);
        let rec_b = PodRecord::new("default", "b", &["img-b"]);

        provider.create_pod(rec_a.clone()).await.unwrap();

        let mut s1 = provider.subscribe("s1").unwrap();
        assert_eq!(names(&frame(&mut s1)), vec!["a"]);

        provider.create_pod(rec_b.clone()).await.unwrap();
        let delta = frame(&mut s1);
        assert_eq!(delta["type"], "schedulePods");
        assert_eq!(names(&delta), vec!["b"]);

        let mut s2 = provider.subscribe("s2").unwrap();
        assert_eq!(names(&frame(&mut s2)), vec!["a", "b"]);

        provider.delete_pod(&rec_a).await.unwrap();
        assert_eq!(provider.get_pods().await.unwrap(), vec![rec_b]);

        let deleted = frame(&mut s1);
        assert_eq!(deleted["type"], "deletePods");
        assert_eq!(deleted["data"][0], "default/a");
    }

    #[tokio::test]
    async fn test_update_replaces_and_broadcasts() {
        let tmp = TempDir::new().unwrap();
        let provider = provider(&tmp);
        provider
            .create_pod(PodRecord::new("default", "a", &["v1"]))
            .await
            .unwrap();
        let mut sub = provider.subscribe("s").unwrap();
        frame(&mut sub);

        provider
            .update_pod(PodRecord::new("default", "a", &["v2"]))
            .await
            .unwrap();

        let update = frame(&mut sub);
        assert_eq!(update["data"][0]["spec"]["containers"][0]["image"], "v2");
        let stored = provider.get_pod("default", "a").await.unwrap().unwrap();
        assert_eq!(stored.first_image(), Some("v2"));
    }

    #[tokio::test]
    async fn test_delete_unknown_pod_is_silent() {
        let tmp = TempDir::new().unwrap();
        let provider = provider(&tmp);
        let mut sub = provider.subscribe("s").unwrap();
        frame(&mut sub);

        provider
            .delete_pod(&PodRecord::new("default", "ghost", &["img"]))
            .await
            .unwrap();

        assert!(sub.frames.try_recv().is_err());
        assert_eq!(provider.metrics().broadcasts.get(), 0);
    }

    #[tokio::test]
    async fn test_dead_subscriber_counted_and_dropped() {
        let tmp = TempDir::new().unwrap();
        let provider = provider(&tmp);
        let dead = provider.subscribe("dead").unwrap();
        let mut live = provider.subscribe("live").unwrap();
        frame(&mut live);
        drop(dead.frames);

        for i in 0..5 {
            let name = format!("pod-{}", i);
            provider
                .create_pod(PodRecord::new("default", &name, &["img"]))
                .await
                .unwrap();
        }

        for i in 0..5 {
            assert_eq!(names(&frame(&mut live)), vec![format!("pod-{}", i)]);
        }
        assert_eq!(provider.subscriber_count(), 1);
        assert_eq!(provider.metrics().delivery_failures.get(), 1);
        assert_eq!(provider.metrics().subscribers.get(), 1);
    }

    #[tokio::test]
    async fn test_unsubscribe_updates_gauge() {
        let tmp = TempDir::new().unwrap();
        let provider = provider(&tmp);
        let sub = provider.subscribe("s").unwrap();
        assert_eq!(provider.metrics().subscribers.get(), 1);

        provider.unsubscribe(&sub.id);
        assert_eq!(provider.metrics().subscribers.get(), 0);
    }

    #[tokio::test]
    async fn test_pod_status_synthesized_for_known_pods() {
        let tmp = TempDir::new().unwrap();
        let provider = provider(&tmp);
        provider
            .create_pod(PodRecord::new("default", "a", &["img"]))
            .await
            .unwrap();

        let status = provider.get_pod_status("default", "a").await.unwrap().unwrap();
        assert_eq!(status.phase.as_deref(), Some("Running"));
        assert_eq!(status.pod_ip.as_deref(), Some("127.0.0.1"));
        assert!(status.container_statuses[0].ready);
        assert!(provider.get_pod_status("default", "b").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_configure_node() {
        let tmp = TempDir::new().unwrap();
        let provider = provider(&tmp);
        let mut node = Node::named("placeholder");

        provider.configure_node(&mut node);

        assert_eq!(node.metadata.name, "vkubelet-browser");
        assert_eq!(node.status.capacity["cpu"], "10000");
        assert_eq!(node.status.capacity["memory"], "4Ti");
        assert_eq!(node.status.allocatable["pods"], "5000");
        assert_eq!(node.condition("Ready").unwrap().status, "True");
        assert_eq!(node.condition("NetworkUnavailable").unwrap().status, "False");
        assert_eq!(node.status.addresses[0].kind, "InternalIP");
        assert_eq!(node.status.kubelet_port, 10250);
        assert_eq!(node.status.node_info.operating_system, "linux");
        assert_eq!(node.metadata.labels[EXCLUDE_BALANCER_LABEL], "true");
    }

    #[tokio::test]
    async fn test_ping_follows_serving_state() {
        let tmp = TempDir::new().unwrap();
        let provider = provider(&tmp);
        assert!(provider.ping().await.is_err());

        provider.set_serving(true);
        assert!(provider.ping().await.is_ok());
    }

    #[tokio::test]
    async fn test_resolve_pod_without_containers() {
        let tmp = TempDir::new().unwrap();
        let provider = provider(&tmp);
        let pod = PodRecord::new("default", "empty", &[]);

        let err = provider
            .resolve_pod_files(&pod, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, NodeError::InvalidReference(_)));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let tmp = TempDir::new().unwrap();
        let mut config = test_config(tmp.path());
        config.payload_files.clear();
        assert!(BrowserProvider::new(config, Arc::new(FakeClient::default())).is_err());
    }
}
