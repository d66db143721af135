//! Node object reported to the cluster by the hosting framework.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Resource name → quantity string (e.g. `"cpu" → "10000"`).
pub type ResourceList = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeCondition {
    #[serde(rename = "type")]
    pub kind: String,
    pub status: String,
    pub last_heartbeat_time: chrono::DateTime<chrono::Utc>,
    pub last_transition_time: chrono::DateTime<chrono::Utc>,
    pub reason: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeAddress {
    #[serde(rename = "type")]
    pub kind: String,
    pub address: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeSystemInfo {
    #[serde(default)]
    pub operating_system: String,
    #[serde(default)]
    pub architecture: String,
    #[serde(default)]
    pub kubelet_version: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStatus {
    #[serde(default)]
    pub capacity: ResourceList,
    #[serde(default)]
    pub allocatable: ResourceList,
    #[serde(default)]
    pub conditions: Vec<NodeCondition>,
    #[serde(default)]
    pub addresses: Vec<NodeAddress>,
    /// Port of the kubelet daemon endpoint.
    #[serde(default)]
    pub kubelet_port: u16,
    #[serde(default)]
    pub node_info: NodeSystemInfo,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeMeta {
    pub name: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

/// The node object the hosting framework registers and keeps updated.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub metadata: NodeMeta,
    #[serde(default)]
    pub status: NodeStatus,
}

impl Node {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            metadata: NodeMeta {
                name: name.into(),
                labels: BTreeMap::new(),
            },
            status: NodeStatus::default(),
        }
    }

    /// Condition of the given type, if reported.
    pub fn condition(&self, kind: &str) -> Option<&NodeCondition> {
        self.status.conditions.iter().find(|c| c.kind == kind)
    }
}
