//! Pods declared as manifest files in a local directory.
//!
//! Lets a node run without a control plane: every `*.json`, `*.yaml` or
//! `*.yml` file in the directory is one pod. Files are loaded at start and
//! then watched; writing a file creates or updates its pod and removing it
//! deletes the pod.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use browser_kube_core::{NodeError, PodRecord, Result};
use notify::{EventKind, RecursiveMode, Watcher};
use tokio_util::sync::CancellationToken;

use crate::lifecycle::PodLifecycleHandler;

/// Whether `path` looks like a pod manifest.
fn is_manifest(path: &Path) -> bool {
    let hidden = path
        .file_name()
        .and_then(|name| name.to_str())
        .map_or(true, |name| name.starts_with('.'));
    let known_extension = matches!(
        path.extension().and_then(|ext| ext.to_str()),
        Some("json") | Some("yaml") | Some("yml")
    );
    !hidden && known_extension
}

/// Parse one manifest file.
pub fn load_manifest(path: &Path) -> Result<PodRecord> {
    let data = std::fs::read(path)?;
    let pod: PodRecord = match path.extension().and_then(|ext| ext.to_str()) {
        Some("json") => serde_json::from_slice(&data)?,
        _ => serde_yaml::from_slice(&data)?,
    };
    if pod.metadata.name.is_empty() {
        return Err(NodeError::Config(format!(
            "pod manifest {} has no metadata.name",
            path.display()
        )));
    }
    Ok(pod)
}

/// Feeds pod manifests from a directory into a lifecycle handler.
pub struct StaticPodSource {
    dir: PathBuf,
    handler: Arc<dyn PodLifecycleHandler>,
    /// Manifest path → pod last applied from it.
    applied: HashMap<PathBuf, PodRecord>,
}

impl StaticPodSource {
    pub fn new(dir: impl Into<PathBuf>, handler: Arc<dyn PodLifecycleHandler>) -> Self {
        Self {
            dir: dir.into(),
            handler,
            applied: HashMap::new(),
        }
    }

    /// Apply every manifest currently in the directory.
    pub async fn load_all(&mut self) -> Result<usize> {
        let mut paths = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            paths.push(entry.path());
        }
        paths.sort();

        for path in &paths {
            self.sync_path(path).await?;
        }
        Ok(self.applied.len())
    }

    /// Bring the handler in line with the current state of `path`.
    pub async fn sync_path(&mut self, path: &Path) -> Result<()> {
        if !is_manifest(path) {
            return Ok(());
        }

        if !path.is_file() {
            if let Some(previous) = self.applied.remove(path) {
                tracing::info!(path = %path.display(), pod = %previous.key(), "Pod manifest removed");
                self.handler.delete_pod(&previous).await?;
            }
            return Ok(());
        }

        let pod = match load_manifest(path) {
            Ok(pod) => pod,
            Err(e) => {
                // Possibly a partial write; the next event retries.
                tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable pod manifest");
                return Ok(());
            }
        };

        match self.applied.get(path) {
            Some(previous) if *previous == pod => return Ok(()),
            Some(previous) if previous.key() == pod.key() => {
                self.handler.update_pod(pod.clone()).await?;
            }
            Some(previous) => {
                self.handler.delete_pod(previous).await?;
                self.handler.create_pod(pod.clone()).await?;
            }
            None => self.handler.create_pod(pod.clone()).await?,
        }
        self.applied.insert(path.to_path_buf(), pod);
        Ok(())
    }

    /// Load the directory, then follow changes until `shutdown`.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<()> {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let mut watcher = notify::recommended_watcher(move |event: notify::Result<notify::Event>| {
            let _ = tx.send(event);
        })
        .map_err(|e| NodeError::Config(format!("Failed to create watcher: {}", e)))?;
        watcher
            .watch(&self.dir, RecursiveMode::NonRecursive)
            .map_err(|e| NodeError::Config(format!("Failed to watch {}: {}", self.dir.display(), e)))?;

        let loaded = self.load_all().await?;
        tracing::info!(dir = %self.dir.display(), pods = loaded, "Watching pod manifests");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                event = rx.recv() => {
                    let event = match event {
                        Some(Ok(event)) => event,
                        Some(Err(e)) => {
                            tracing::warn!(error = %e, "Pod manifest watch error");
                            continue;
                        }
                        None => break,
                    };
                    if matches!(event.kind, EventKind::Access(_)) {
                        continue;
                    }
                    for path in &event.paths {
                        if let Err(e) = self.sync_path(path).await {
                            tracing::warn!(path = %path.display(), error = %e, "Failed to apply pod manifest");
                        }
                    }
                }
            }
        }

        tracing::debug!(dir = %self.dir.display(), "Stopped watching pod manifests");
        Ok(())
    }
}
