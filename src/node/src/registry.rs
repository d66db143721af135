//! Pod registry.
//!
//! Authoritative map of the pods currently assigned to this node.

use std::collections::{BTreeMap, HashMap};

use browser_kube_core::{PodKey, PodRecord};
use parking_lot::RwLock;

/// In-memory store for pod records, keyed by `(namespace, name)`.
#[derive(Default)]
pub struct PodRegistry {
    pods: RwLock<HashMap<PodKey, PodRecord>>,
}

impl PodRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the record under `key`.
    ///
    /// Returns the record it replaced, if any.
    pub fn put(&self, key: PodKey, record: PodRecord) -> Option<PodRecord> {
        self.pods.write().insert(key, record)
    }

    /// Remove the record under `key`. Absent keys are a no-op.
    pub fn delete(&self, key: &PodKey) -> Option<PodRecord> {
        self.pods.write().remove(key)
    }

    pub fn get(&self, key: &PodKey) -> Option<PodRecord> {
        self.pods.read().get(key).cloned()
    }

    pub fn contains(&self, key: &PodKey) -> bool {
        self.pods.read().contains_key(key)
    }

    /// All records, sorted by key.
    pub fn list(&self) -> Vec<PodRecord> {
        let pods = self.pods.read();
        let mut entries: Vec<(&PodKey, &PodRecord)> = pods.iter().collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));
        entries.into_iter().map(|(_, pod)| pod.clone()).collect()
    }

    /// Records keyed by their `"namespace/name"` rendering.
    pub fn snapshot(&self) -> BTreeMap<String, PodRecord> {
        self.pods
            .read()
            .iter()
            .map(|(key, pod)| (key.to_string(), pod.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.pods.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pods.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn pod(namespace: &str, name: &str) -> PodRecord {
        PodRecord::new(namespace, name, &["busybox"])
    }

    #[test]
    fn test_put_and_get() {
        let registry = PodRegistry::new();
        let record = pod("default", "a");
        registry.put(record.key(), record.clone());

        assert_eq!(registry.get(&PodKey::new("default", "a")), Some(record));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_put_replaces_wholesale() {
        let registry = PodRegistry::new();
        let key = PodKey::new("default", "a");
        registry.put(key.clone(), pod("default", "a"));

        let mut updated = pod("default", "a");
        updated.spec.containers[0].image = "hello-wasm:v2".to_string();
        let previous = registry.put(key.clone(), updated.clone());

        assert!(previous.is_some());
        assert_eq!(registry.get(&key), Some(updated));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_delete_absent_is_noop() {
        let registry = PodRegistry::new();
        registry.put(PodKey::new("default", "a"), pod("default", "a"));

        assert!(registry.delete(&PodKey::new("default", "missing")).is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_delete_removes() {
        let registry = PodRegistry::new();
        let key = PodKey::new("default", "a");
        registry.put(key.clone(), pod("default", "a"));

        assert!(registry.delete(&key).is_some());
        assert!(!registry.contains(&key));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_same_name_in_different_namespaces() {
        let registry = PodRegistry::new();
        registry.put(PodKey::new("ns1", "a"), pod("ns1", "a"));
        registry.put(PodKey::new("ns2", "a"), pod("ns2", "a"));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_list_sorted_by_key() {
        let registry = PodRegistry::new();
        for (ns, name) in [("kube", "z"), ("default", "b"), ("default", "a")] {
            registry.put(PodKey::new(ns, name), pod(ns, name));
        }

        let keys: Vec<String> = registry.list().iter().map(|p| p.key().to_string()).collect();
        assert_eq!(keys, vec!["default/a", "default/b", "kube/z"]);
    }

    #[test]
    fn test_snapshot_keys() {
        let registry = PodRegistry::new();
        registry.put(PodKey::new("default", "a"), pod("default", "a"));

        let snapshot = registry.snapshot();
        assert!(snapshot.contains_key("default/a"));
    }

    #[test]
    fn test_concurrent_puts() {
        let registry = Arc::new(PodRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    for i in 0..50 {
                        let name = format!("pod-{}-{}", t, i);
                        registry.put(PodKey::new("default", &name), pod("default", &name));
                        let _ = registry.list();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(registry.len(), 400);
    }
}
