//! browser-kube Core - Foundational Types
//!
//! Types shared between the image runtime and the node agent: the error
//! type, configuration, the pod and node data model, and the messages
//! broadcast to connected browsers.

pub mod config;
pub mod error;
pub mod event;
pub mod node;
pub mod pod;

// Re-export commonly used types
pub use config::{ImageSource, NodeConfig};
pub use error::{NodeError, Result};
pub use event::{BroadcastEvent, Message};
pub use node::Node;
pub use pod::{PodKey, PodRecord, PodStatus};

/// browser-kube version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
