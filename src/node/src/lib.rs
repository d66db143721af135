//! browser-kube node - a virtual Kubernetes node backed by browser tabs.
//!
//! Pods bound to the node are kept in a [`registry::PodRegistry`] and pushed
//! to every connected browser over WebSocket. Browsers fetch the WASM payload
//! of a pod from the [`gateway::Gateway`], which extracts it from the pod's
//! container image.

pub mod gateway;
pub mod hub;
pub mod lifecycle;
pub mod metrics;
pub mod provider;
pub mod registry;
pub mod static_pods;

pub use gateway::Gateway;
pub use lifecycle::{NodeProvider, PodLifecycleHandler};
pub use provider::BrowserProvider;
pub use static_pods::StaticPodSource;

/// browser-kube node version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
