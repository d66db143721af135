//! Pod data model.
//!
//! A deliberately small typed view over the Kubernetes `Pod` object. Fields the
//! node does not interpret are kept verbatim in `extra` maps so a record can be
//! handed back to the browser exactly as the control plane sent it.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Unique identifier of a pod on this node: `(namespace, name)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PodKey {
    pub namespace: String,
    pub name: String,
}

impl PodKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for PodKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl Serialize for PodKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

fn default_namespace() -> String {
    "default".to_string()
}

/// Object metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub name: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// A single container of a pod.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Container {
    pub name: String,
    #[serde(default)]
    pub image: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_pull_policy: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Desired state of a pod.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,
    #[serde(default)]
    pub containers: Vec<Container>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Condition entry of a pod status.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodCondition {
    #[serde(rename = "type")]
    pub kind: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Per-container status entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerStatus {
    pub name: String,
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub ready: bool,
    #[serde(default)]
    pub restart_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<serde_json::Value>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Observed state of a pod.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<PodCondition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub container_statuses: Vec<ContainerStatus>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// A pod as received from the control plane.
///
/// Owned by the pod registry and replaced wholesale on update.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: PodSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<PodStatus>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl PodRecord {
    /// Build a minimal pod with one container per image.
    pub fn new(namespace: &str, name: &str, images: &[&str]) -> Self {
        Self {
            api_version: Some("v1".to_string()),
            kind: Some("Pod".to_string()),
            metadata: ObjectMeta {
                name: name.to_string(),
                namespace: namespace.to_string(),
                ..Default::default()
            },
            spec: PodSpec {
                containers: images
                    .iter()
                    .enumerate()
                    .map(|(i, image)| Container {
                        name: format!("container-{}", i),
                        image: image.to_string(),
                        ..Default::default()
                    })
                    .collect(),
                ..Default::default()
            },
            status: None,
            extra: Default::default(),
        }
    }

    /// Registry key derived from the pod's metadata.
    pub fn key(&self) -> PodKey {
        PodKey::new(&self.metadata.namespace, &self.metadata.name)
    }

    /// Image of the first container, if the pod has any.
    pub fn first_image(&self) -> Option<&str> {
        self.spec
            .containers
            .first()
            .map(|c| c.image.as_str())
            .filter(|image| !image.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_display() {
        let pod = PodRecord::new("default", "my-test-pod", &["busybox"]);
        assert_eq!(pod.key().to_string(), "default/my-test-pod");
    }

    #[test]
    fn test_key_serializes_as_string() {
        let key = PodKey::new("kube-public", "a");
        assert_eq!(serde_json::to_string(&key).unwrap(), "\"kube-public/a\"");
    }

    #[test]
    fn test_first_image() {
        let pod = PodRecord::new("default", "a", &["hello-wasm:latest", "sidecar"]);
        assert_eq!(pod.first_image(), Some("hello-wasm:latest"));

        let empty = PodRecord::new("default", "b", &[]);
        assert_eq!(empty.first_image(), None);
    }

    #[test]
    fn test_namespace_defaults_to_default() {
        let pod: PodRecord = serde_json::from_value(serde_json::json!({
            "metadata": { "name": "no-ns" },
            "spec": { "containers": [{ "name": "c", "image": "img" }] }
        }))
        .unwrap();
        assert_eq!(pod.key(), PodKey::new("default", "no-ns"));
    }

    #[test]
    fn test_unknown_fields_are_preserved() {
        let input = serde_json::json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {
                "name": "my-test-pod",
                "namespace": "default",
                "labels": { "app": "demo" },
                "resourceVersion": "42"
            },
            "spec": {
                "nodeName": "vkubelet-browser",
                "restartPolicy": "Always",
                "containers": [{
                    "name": "busybox",
                    "image": "busybox",
                    "imagePullPolicy": "IfNotPresent",
                    "command": ["sleep", "3600"],
                    "resources": { "limits": { "cpu": "1" } }
                }]
            },
            "status": {
                "phase": "Pending",
                "qosClass": "BestEffort",
                "conditions": [{
                    "type": "PodScheduled",
                    "status": "True",
                    "reason": "Scheduled",
                    "lastProbeTime": null
                }],
                "containerStatuses": [{
                    "name": "busybox",
                    "image": "busybox",
                    "imageID": "sha256:x",
                    "containerID": "browser://busybox",
                    "ready": false,
                    "restartCount": 0,
                    "started": false,
                    "lastState": {}
                }]
            },
            "managedFields": [{ "manager": "kubectl" }]
        });
        let pod: PodRecord = serde_json::from_value(input.clone()).unwrap();
        assert_eq!(pod.metadata.extra["resourceVersion"], "42");
        assert_eq!(pod.spec.extra["restartPolicy"], "Always");
        let status = pod.status.as_ref().unwrap();
        assert_eq!(status.conditions[0].extra["reason"], "Scheduled");
        assert_eq!(status.container_statuses[0].extra["imageID"], "sha256:x");
        assert_eq!(pod.extra["managedFields"][0]["manager"], "kubectl");
        assert_eq!(pod.spec.containers[0].command, vec!["sleep", "3600"]);

        let output = serde_json::to_value(&pod).unwrap();
        assert_eq!(output, input);
    }

    #[test]
    fn test_pod_from_yaml() {
        let yaml = r#"
apiVersion: v1
kind: Pod
metadata:
  name: hello
  namespace: wasm
spec:
  containers:
    - name: app
      image: danielmschmidt/hello-wasm:latest
"#;
        let pod: PodRecord = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(pod.key().to_string(), "wasm/hello");
        assert_eq!(pod.first_image(), Some("danielmschmidt/hello-wasm:latest"));
    }
}
