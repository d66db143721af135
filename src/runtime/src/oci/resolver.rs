//! Image content resolver.
//!
//! Materializes the merged filesystem of an image and reads files out of it:
//!
//! ```text
//! pull ─► save-archive ─► <base>/save/<image>/      (manifest.json + layer archives)
//!                              │
//!                              ▼  layers unpacked in manifest order
//!                         <base>/content/<image>/   (merged filesystem)
//!                              │
//!                              ▼
//!                         requested files
//! ```
//!
//! At most one resolve runs per image reference. Callers that queue behind
//! it reuse the content it materialized. With a non-zero TTL the merged
//! content is also reused by later calls until
//! [`ImageContentResolver::evict_expired`] removes it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use browser_kube_core::error::{NodeError, Result};
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::OwnedMutexGuard;
use tokio_util::sync::CancellationToken;

use super::client::{ContainerClient, SaveArchive};
use super::layers::{sanitize_entry_path, unpack_cancellable, unpack_file};
use super::manifest::read_manifest;

/// Requested in-image path paired with its content, in request order.
pub type ExtractedFiles = Vec<(String, Vec<u8>)>;

const SAVE_AREA: &str = "save";
const CONTENT_AREA: &str = "content";

/// Pulls images and extracts files from their merged layer filesystem.
pub struct ImageContentResolver {
    base_path: PathBuf,
    client: Arc<dyn ContainerClient>,
    ttl: Duration,
    /// Per-reference lock serializing resolves of the same image.
    inflight: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    /// Reference → when its content was last materialized.
    materialized: Mutex<HashMap<String, Instant>>,
}

impl ImageContentResolver {
    /// Create a resolver working under `base_path`.
    ///
    /// A zero `ttl` re-materializes the image on every call.
    pub fn new(base_path: impl Into<PathBuf>, client: Arc<dyn ContainerClient>, ttl: Duration) -> Self {
        Self {
            base_path: base_path.into(),
            client,
            ttl,
            inflight: DashMap::new(),
            materialized: Mutex::new(HashMap::new()),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Directory holding the unpacked save-archive of `reference`.
    pub fn save_dir(&self, reference: &str) -> Result<PathBuf> {
        Ok(self
            .base_path
            .join(SAVE_AREA)
            .join(reference_path(reference)?))
    }

    /// Directory holding the merged layer filesystem of `reference`.
    pub fn content_dir(&self, reference: &str) -> Result<PathBuf> {
        Ok(self
            .base_path
            .join(CONTENT_AREA)
            .join(reference_path(reference)?))
    }

    /// Resolve `paths` inside image `reference`.
    ///
    /// Returns every requested file in request order, or an error; never a
    /// partial result. Cancelling `cancel` aborts between stages and while
    /// waiting on the network, returning [`NodeError::Cancelled`].
    pub async fn resolve(
        &self,
        reference: &str,
        paths: &[String],
        cancel: &CancellationToken,
    ) -> Result<ExtractedFiles> {
        let save_dir = self.save_dir(reference)?;
        let content_dir = self.content_dir(reference)?;

        let lock = self
            .inflight
            .entry(reference.to_string())
            .or_default()
            .clone();

        let result = self
            .resolve_locked(reference, paths, lock, &save_dir, &content_dir, cancel)
            .await;

        // A guard still held by an abandoned unpack keeps the entry alive.
        self.inflight
            .remove_if(reference, |_, lock| Arc::strong_count(lock) == 1);

        result
    }

    async fn resolve_locked(
        &self,
        reference: &str,
        paths: &[String],
        lock: Arc<tokio::sync::Mutex<()>>,
        save_dir: &Path,
        content_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<ExtractedFiles> {
        let requested_at = Instant::now();
        let guard = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(NodeError::Cancelled),
            guard = lock.lock_owned() => guard,
        };

        let guard = if self.reusable(reference, content_dir, requested_at) {
            tracing::debug!(reference = %reference, "Reusing materialized image content");
            guard
        } else {
            self.materialize(reference, save_dir, content_dir, guard, cancel)
                .await?
        };

        if cancel.is_cancelled() {
            return Err(NodeError::Cancelled);
        }
        let files = read_files(content_dir, paths).await;
        drop(guard);
        files
    }

    /// Pull, save and unpack `reference` into its save and content areas.
    ///
    /// The per-reference guard travels into the blocking unpack and comes
    /// back with it, so the areas stay locked until the last write even if
    /// the calling future is dropped.
    async fn materialize(
        &self,
        reference: &str,
        save_dir: &Path,
        content_dir: &Path,
        guard: OwnedMutexGuard<()>,
        cancel: &CancellationToken,
    ) -> Result<OwnedMutexGuard<()>> {
        let started = Instant::now();
        self.materialized.lock().remove(reference);

        for area in [SAVE_AREA, CONTENT_AREA] {
            tokio::fs::create_dir_all(self.base_path.join(area)).await?;
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(NodeError::Cancelled),
            pulled = self.client.pull(reference) => pulled?,
        }

        let archive = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(NodeError::Cancelled),
            saved = self.client.save(reference) => saved?,
        };

        let save_dir_owned = save_dir.to_path_buf();
        let content_dir_owned = content_dir.to_path_buf();
        let token = cancel.clone();
        let (guard, unpacked) = tokio::task::spawn_blocking(move || {
            let unpacked = unpack_image(archive, &save_dir_owned, &content_dir_owned, &token);
            (guard, unpacked)
        })
        .await
        .map_err(|e| NodeError::Unpack(format!("unpack task failed: {}", e)))?;
        let layers = unpacked?;

        self.materialized
            .lock()
            .insert(reference.to_string(), Instant::now());

        tracing::info!(
            reference = %reference,
            layers,
            elapsed_ms = started.elapsed().as_millis() as u64,
            content = %content_dir.display(),
            "Materialized image content"
        );
        Ok(guard)
    }

    /// Whether the content on disk can serve a caller that asked at
    /// `requested_at`: either it was materialized while that caller waited
    /// for the lock, or it is still within the TTL.
    fn reusable(&self, reference: &str, content_dir: &Path, requested_at: Instant) -> bool {
        let Some(at) = self.materialized.lock().get(reference).copied() else {
            return false;
        };
        let shared = at >= requested_at;
        let fresh = !self.ttl.is_zero() && at.elapsed() < self.ttl;
        (shared || fresh) && content_dir.is_dir()
    }

    /// Remove save and content areas of images whose TTL elapsed.
    ///
    /// Images with a resolve in progress are left for the next pass.
    /// Returns the evicted references.
    pub async fn evict_expired(&self) -> Result<Vec<String>> {
        if self.ttl.is_zero() {
            return Ok(Vec::new());
        }

        let expired: Vec<String> = self
            .materialized
            .lock()
            .iter()
            .filter(|(_, at)| at.elapsed() >= self.ttl)
            .map(|(reference, _)| reference.clone())
            .collect();

        let mut evicted = Vec::with_capacity(expired.len());
        for reference in expired {
            let lock = self.inflight.entry(reference.clone()).or_default().clone();
            let removed = match lock.try_lock() {
                Ok(_guard) => {
                    self.remove_areas(&reference).await?;
                    self.materialized.lock().remove(&reference);
                    true
                }
                Err(_) => false,
            };
            drop(lock);
            self.inflight
                .remove_if(&reference, |_, lock| Arc::strong_count(lock) == 1);
            if removed {
                evicted.push(reference);
            }
        }

        if !evicted.is_empty() {
            tracing::info!(count = evicted.len(), references = ?evicted, "Evicted image content");
        }
        Ok(evicted)
    }

    /// Remove everything materialized for `reference`.
    pub async fn remove(&self, reference: &str) -> Result<()> {
        let lock = self
            .inflight
            .entry(reference.to_string())
            .or_default()
            .clone();
        {
            let _guard = lock.lock().await;
            self.remove_areas(reference).await?;
            self.materialized.lock().remove(reference);
        }
        drop(lock);
        self.inflight
            .remove_if(reference, |_, lock| Arc::strong_count(lock) == 1);
        Ok(())
    }

    async fn remove_areas(&self, reference: &str) -> Result<()> {
        for dir in [self.save_dir(reference)?, self.content_dir(reference)?] {
            match tokio::fs::remove_dir_all(&dir).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

/// Relative directory for an image reference under the save/content areas.
fn reference_path(reference: &str) -> Result<PathBuf> {
    let trimmed = reference.trim();
    if trimmed.is_empty() {
        return Err(NodeError::InvalidReference("empty image reference".to_string()));
    }
    let path = sanitize_entry_path(Path::new(trimmed))
        .map_err(|_| NodeError::InvalidReference(format!("'{}' escapes the image area", reference)))?;
    if path.as_os_str().is_empty() {
        return Err(NodeError::InvalidReference(format!("'{}'", reference)));
    }
    Ok(path)
}

/// Unpack the save-archive, then each layer of the first manifest entry in
/// listed order. Returns the number of layers applied.
fn unpack_image(
    archive: SaveArchive,
    save_dir: &Path,
    content_dir: &Path,
    cancel: &CancellationToken,
) -> Result<usize> {
    // Start from a clean slate so files of a previous image version cannot
    // satisfy a request.
    for dir in [save_dir, content_dir] {
        match std::fs::remove_dir_all(dir) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }

    unpack_cancellable(archive, save_dir, cancel)?;

    let manifests = read_manifest(save_dir)?;
    let entry = &manifests[0];

    std::fs::create_dir_all(content_dir)?;
    for layer in &entry.layers {
        if cancel.is_cancelled() {
            return Err(NodeError::Cancelled);
        }

        let layer_path = sanitize_entry_path(Path::new(layer))
            .map(|relative| save_dir.join(relative))
            .map_err(|e| NodeError::LayerRead {
                layer: layer.clone(),
                message: e.to_string(),
            })?;
        if !layer_path.is_file() {
            return Err(NodeError::LayerRead {
                layer: layer.clone(),
                message: "Could not find layer from manifest.json".to_string(),
            });
        }

        unpack_file(&layer_path, content_dir, cancel).map_err(|e| match e {
            NodeError::Unpack(message) => NodeError::Unpack(format!("layer {}: {}", layer, message)),
            other => other,
        })?;
    }

    Ok(entry.layers.len())
}

async fn read_files(content_dir: &Path, paths: &[String]) -> Result<ExtractedFiles> {
    let mut files = Vec::with_capacity(paths.len());
    for path in paths {
        let relative = sanitize_entry_path(Path::new(path)).map_err(|_| NodeError::FileMissing {
            path: path.clone(),
        })?;
        match tokio::fs::read(content_dir.join(relative)).await {
            Ok(content) => files.push((path.clone(), content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(NodeError::FileMissing { path: path.clone() })
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(files)
}
