//! Prometheus metrics exposed at `/metrics`.

use browser_kube_core::{NodeError, Result};
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

/// Node-level metrics, registered in a private registry.
pub struct NodeMetrics {
    registry: Registry,
    /// Pods currently in the registry.
    pub pods: IntGauge,
    /// Connected WebSocket subscribers.
    pub subscribers: IntGauge,
    /// Events broadcast to subscribers.
    pub broadcasts: IntCounter,
    /// Subscribers dropped after a failed delivery.
    pub delivery_failures: IntCounter,
    /// File resolutions by outcome (`ok` or an error stage).
    pub resolves: IntCounterVec,
}

impl NodeMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new_custom(Some("browser_kube".to_string()), None)
            .map_err(metrics_err)?;

        let pods = IntGauge::new("pods", "Pods assigned to this node").map_err(metrics_err)?;
        let subscribers =
            IntGauge::new("subscribers", "Connected browser subscribers").map_err(metrics_err)?;
        let broadcasts =
            IntCounter::new("broadcasts_total", "Events broadcast to subscribers").map_err(metrics_err)?;
        let delivery_failures = IntCounter::new(
            "delivery_failures_total",
            "Subscribers dropped after a failed delivery",
        )
        .map_err(metrics_err)?;
        let resolves = IntCounterVec::new(
            Opts::new("resolves_total", "Image file resolutions by result"),
            &["result"],
        )
        .map_err(metrics_err)?;

        registry.register(Box::new(pods.clone())).map_err(metrics_err)?;
        registry.register(Box::new(subscribers.clone())).map_err(metrics_err)?;
        registry.register(Box::new(broadcasts.clone())).map_err(metrics_err)?;
        registry
            .register(Box::new(delivery_failures.clone()))
            .map_err(metrics_err)?;
        registry.register(Box::new(resolves.clone())).map_err(metrics_err)?;

        Ok(Self {
            registry,
            pods,
            subscribers,
            broadcasts,
            delivery_failures,
            resolves,
        })
    }

    /// Record the outcome of one resolution.
    pub fn record_resolve(&self, result: &Result<impl Sized>) {
        let label = match result {
            Ok(_) => "ok",
            Err(e) => e.stage(),
        };
        self.resolves.with_label_values(&[label]).inc();
    }

    /// Render all metrics in the Prometheus text format.
    pub fn encode(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(metrics_err)?;
        String::from_utf8(buffer).map_err(|e| NodeError::Server(format!("metrics: {}", e)))
    }
}

fn metrics_err(e: prometheus::Error) -> NodeError {
    NodeError::Server(format!("metrics: {}", e))
}
