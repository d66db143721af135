//! Tar archive unpacking.
//!
//! Decodes a single tar stream (plain or gzip-compressed) into a directory
//! tree. Used both for `docker save` style archives and for the layer
//! archives they contain.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Read};
use std::path::{Component, Path, PathBuf};

use browser_kube_core::error::{NodeError, Result};
use flate2::read::GzDecoder;
use tar::{Archive, EntryType};
use tokio_util::sync::CancellationToken;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Counters reported by [`unpack`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct UnpackStats {
    pub files: usize,
    pub directories: usize,
    /// Symlinks, hard links, devices and other entries that are not extracted.
    pub skipped: usize,
}

/// Unpack a tar stream into `dst`.
///
/// Directory entries are created if missing. Regular files are (re)created
/// with the entry's permission bits and exactly the entry's byte length;
/// each file handle is closed before the next entry is read. Other entry
/// types are skipped. Unpacking the same archive twice leaves the same tree.
///
/// # Errors
///
/// Returns [`NodeError::Unpack`] if the stream cannot be read, an entry is
/// truncated, an entry path escapes `dst`, or a file cannot be written.
pub fn unpack<R: Read>(reader: R, dst: &Path) -> Result<UnpackStats> {
    unpack_cancellable(reader, dst, &CancellationToken::new())
}

/// Like [`unpack`], but stops with [`NodeError::Cancelled`] before the next
/// entry once `cancel` fires.
pub fn unpack_cancellable<R: Read>(
    reader: R,
    dst: &Path,
    cancel: &CancellationToken,
) -> Result<UnpackStats> {
    fs::create_dir_all(dst).map_err(|e| {
        NodeError::Unpack(format!(
            "Failed to create target directory {}: {}",
            dst.display(),
            e
        ))
    })?;

    let mut buffered = BufReader::new(reader);
    let is_gzip = buffered
        .fill_buf()
        .map_err(|e| NodeError::Unpack(format!("Failed to read archive: {}", e)))?
        .starts_with(&GZIP_MAGIC);

    if is_gzip {
        unpack_entries(GzDecoder::new(buffered), dst, cancel)
    } else {
        unpack_entries(buffered, dst, cancel)
    }
}

/// Unpack the archive stored at `archive_path` into `dst`.
pub fn unpack_file(archive_path: &Path, dst: &Path, cancel: &CancellationToken) -> Result<UnpackStats> {
    let file = File::open(archive_path).map_err(|e| {
        NodeError::Unpack(format!(
            "Failed to open archive {}: {}",
            archive_path.display(),
            e
        ))
    })?;
    unpack_cancellable(file, dst, cancel)
}

fn unpack_entries<R: Read>(reader: R, dst: &Path, cancel: &CancellationToken) -> Result<UnpackStats> {
    let mut archive = Archive::new(reader);
    let mut stats = UnpackStats::default();

    let entries = archive
        .entries()
        .map_err(|e| NodeError::Unpack(format!("Failed to read archive: {}", e)))?;

    for entry in entries {
        if cancel.is_cancelled() {
            return Err(NodeError::Cancelled);
        }
        let mut entry =
            entry.map_err(|e| NodeError::Unpack(format!("Failed to read archive entry: {}", e)))?;

        let raw_path = entry
            .path()
            .map_err(|e| NodeError::Unpack(format!("Invalid entry path: {}", e)))?
            .into_owned();
        let relative = sanitize_entry_path(&raw_path)?;
        if relative.as_os_str().is_empty() {
            continue;
        }
        let target = dst.join(&relative);

        match entry.header().entry_type() {
            EntryType::Directory => {
                if !target.is_dir() {
                    // A file from an earlier layer gives way to the directory.
                    if fs::symlink_metadata(&target).is_ok() {
                        fs::remove_file(&target).map_err(|e| {
                            NodeError::Unpack(format!(
                                "Failed to replace {}: {}",
                                target.display(),
                                e
                            ))
                        })?;
                    }
                    fs::create_dir_all(&target).map_err(|e| {
                        NodeError::Unpack(format!(
                            "Failed to create directory {}: {}",
                            target.display(),
                            e
                        ))
                    })?;
                }
                stats.directories += 1;
            }
            EntryType::Regular | EntryType::Continuous => {
                let size = entry
                    .header()
                    .size()
                    .map_err(|e| NodeError::Unpack(format!("Invalid entry size: {}", e)))?;
                let mode = entry.header().mode().unwrap_or(0o644);
                write_file(&mut entry, &target, size, mode)?;
                stats.files += 1;
            }
            other => {
                tracing::trace!(
                    path = %raw_path.display(),
                    entry_type = ?other,
                    "Skipping unsupported archive entry"
                );
                stats.skipped += 1;
            }
        }
    }

    tracing::debug!(
        target = %dst.display(),
        files = stats.files,
        directories = stats.directories,
        skipped = stats.skipped,
        "Unpacked archive"
    );

    Ok(stats)
}

/// Copy exactly `size` bytes of `entry` to a fresh file at `target`.
fn write_file<R: Read>(entry: &mut R, target: &Path, size: u64, mode: u32) -> Result<()> {
    let write_err = |e: std::io::Error| {
        NodeError::Unpack(format!("Failed to write {}: {}", target.display(), e))
    };

    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).map_err(write_err)?;
    }

    // A later layer replaces whatever an earlier one put at this path,
    // including read-only files and directories.
    match fs::symlink_metadata(target) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(target).map_err(write_err)?,
        Ok(_) => fs::remove_file(target).map_err(write_err)?,
        Err(_) => {}
    }

    let mut file = open_with_mode(target, mode).map_err(write_err)?;
    let copied = std::io::copy(&mut entry.take(size), &mut file).map_err(write_err)?;
    if copied != size {
        return Err(NodeError::Unpack(format!(
            "Truncated entry {}: expected {} bytes, got {}",
            target.display(),
            size,
            copied
        )));
    }
    Ok(())
}

#[cfg(unix)]
fn open_with_mode(path: &Path, mode: u32) -> std::io::Result<File> {
    use std::os::unix::fs::OpenOptionsExt;
    OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(mode & 0o7777)
        .open(path)
}

#[cfg(not(unix))]
fn open_with_mode(path: &Path, _mode: u32) -> std::io::Result<File> {
    OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
}

/// Turn an archive entry path into a path relative to the extraction root.
///
/// Leading `/` and `.` components are dropped; `..` is rejected.
pub(crate) fn sanitize_entry_path(path: &Path) -> Result<PathBuf> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
            Component::ParentDir => {
                return Err(NodeError::Unpack(format!(
                    "Entry path escapes extraction root: {}",
                    path.display()
                )))
            }
        }
    }
    Ok(out)
}
