//! Image handling for browser payloads.
//!
//! Turns an image reference into the files a browser node serves:
//!
//! - [`ContainerClient`]: pull an image and hand out its save-archive
//!   (`docker` CLI or a direct OCI registry client)
//! - [`manifest`]: the `manifest.json` listing layers in application order
//! - [`layers`]: tar/tar.gz unpacking with overwrite semantics
//! - [`ImageContentResolver`]: merges the layers and reads requested files
//!
//! # Layout
//!
//! ```text
//! <image_base_path>/
//! ├── save/<image>/          (unpacked save-archive)
//! │   ├── manifest.json
//! │   └── <layer>/layer.tar
//! └── content/<image>/       (merged layer filesystem)
//! ```

pub mod client;
pub mod layers;
pub mod manifest;
pub mod registry;
mod resolver;

pub use client::{ContainerClient, DockerCliClient, SaveArchive};
pub use layers::{unpack, unpack_cancellable, unpack_file, UnpackStats};
pub use manifest::{parse_manifest, read_manifest, ImageManifestEntry, MANIFEST_FILE};
pub use registry::{RegistryAuth, RegistryClient};
pub use resolver::{ExtractedFiles, ImageContentResolver};
